//! A single inbound MCP session over process stdio.
//!
//! Line-delimited JSON-RPC: one message per line on stdin, one per line on
//! stdout. There is no authentication on this transport; the tag filter is
//! configured out-of-band via CLI flags.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use mcp_types::JSONRPCMessage;
use onemcp_core::filter::FilterContext;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::message_processor::MessageProcessor;
use crate::proxy::ProxyState;
use crate::session::InboundSession;

pub async fn run_stdio_session(
    state: Arc<ProxyState>,
    filter: FilterContext,
    pagination: bool,
) -> Result<()> {
    let session = InboundSession::new("stdio".to_string(), filter, None, pagination);
    state.sessions.insert(Arc::clone(&session));

    let mut outgoing_rx = session
        .take_outgoing()
        .context("stdio outgoing stream already taken")?;

    // Writer task: everything addressed to the client goes to stdout, one
    // JSON document per line.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outgoing_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!("failed to serialize outgoing message: {err}");
                    continue;
                }
            };
            if stdout.write_all(json.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut processor = MessageProcessor::new(Arc::clone(&session), Arc::clone(&state.dispatcher));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let message = match serde_json::from_str::<JSONRPCMessage>(&line) {
                            Ok(message) => message,
                            Err(err) => {
                                error!("failed to deserialize JSONRPCMessage: {err}; line = {line}");
                                continue;
                            }
                        };
                        if let Some(reply) = processor.process(message).await {
                            session.outgoing.send_message(reply).await;
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed; shutting down stdio session");
                        break;
                    }
                    Err(err) => {
                        error!("failed to read stdin: {err}");
                        break;
                    }
                }
            }
            _ = session.cancel.cancelled() => {
                debug!("stdio session cancelled");
                break;
            }
        }
    }

    state.sessions.remove(&session.id);
    writer.abort();
    Ok(())
}
