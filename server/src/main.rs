use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::ValueEnum;
use onemcp_core::config;
use onemcp_core::filter::FilterContext;
use onemcp_core::filter::parse_simple_tags;
use onemcp_core::filter::parse_tag_filter;
use onemcp_server::http;
use onemcp_server::proxy::ProxyState;
use onemcp_server::proxy::spawn_event_loops;
use onemcp_server::stdio::run_stdio_session;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportMode {
    Stdio,
    Http,
}

#[derive(Debug, Parser)]
#[command(
    name = "onemcp",
    about = "Aggregating proxy for the Model Context Protocol"
)]
struct Cli {
    /// Inbound transport to serve.
    #[arg(long, value_enum, default_value = "http")]
    transport: TransportMode,

    /// Bind host for the HTTP transports.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port for the HTTP transports.
    #[arg(long, default_value_t = 3050)]
    port: u16,

    /// Path to the server catalog. Defaults to `$ONE_MCP_CONFIG` or
    /// `<config_dir>/mcp.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Externally visible base URL, used as the OAuth issuer. Defaults to
    /// `http://<host>:<port>`.
    #[arg(long)]
    public_url: Option<String>,

    /// Comma-separated tag list for the stdio session (OR semantics).
    #[arg(long)]
    tags: Option<String>,

    /// Boolean tag expression for the stdio session.
    #[arg(long = "tag-filter")]
    tag_filter: Option<String>,

    /// Enable cross-server pagination for the stdio session.
    #[arg(long, default_value_t = false)]
    pagination: bool,

    /// Gate the HTTP transports with OAuth 2.1.
    #[arg(long, default_value_t = false)]
    enable_auth: bool,
}

fn init_logging() {
    let filter = match std::env::var("ONE_MCP_LOG_LEVEL") {
        Ok(level) if !level.is_empty() => EnvFilter::new(level),
        _ => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn stdio_filter(cli: &Cli) -> Result<FilterContext> {
    match (&cli.tags, &cli.tag_filter) {
        (Some(_), Some(_)) => bail!("--tags and --tag-filter are mutually exclusive"),
        (Some(tags), None) => Ok(FilterContext::Simple(parse_simple_tags(tags)?)),
        (None, Some(expr)) => Ok(FilterContext::Expression(parse_tag_filter(expr)?)),
        (None, None) => Ok(FilterContext::None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config_dir = config::resolve_config_dir()
        .context("failed to resolve the configuration directory")?;
    let catalog_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::resolve_config_file()
            .context("failed to resolve the catalog path")?,
    };
    let public_url = cli
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", cli.host, cli.port));

    info!(
        "starting onemcp with catalog {} (config dir {})",
        catalog_path.display(),
        config_dir.display()
    );

    let (state, events_rx) = ProxyState::bootstrap(
        config_dir,
        catalog_path,
        cli.enable_auth && cli.transport == TransportMode::Http,
        public_url,
    )
    .await?;
    spawn_event_loops(state.clone(), events_rx);

    match cli.transport {
        TransportMode::Stdio => {
            let filter = stdio_filter(&cli)?;
            run_stdio_session(state.clone(), filter, cli.pagination).await?;
        }
        TransportMode::Http => {
            let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
                .parse()
                .with_context(|| format!("invalid bind address {}:{}", cli.host, cli.port))?;
            tokio::select! {
                result = http::serve(state.clone(), addr) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; shutting down");
                }
            }
        }
    }

    state.manager.shutdown().await;
    Ok(())
}
