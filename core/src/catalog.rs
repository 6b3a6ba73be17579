//! Loads the server catalog and watches it for changes.
//!
//! The watcher is registered on the catalog's *parent directory* so that
//! editors which save via write-temp-then-rename still produce events for the
//! catalog path. Raw notify events are bridged into the Tokio runtime and
//! debounced; reload failures keep the last good snapshot.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::sleep_until;
use tracing::info;
use tracing::warn;

use crate::config::CatalogSnapshot;
use crate::config::parse_catalog;
use crate::error::ProxyError;

/// How long to wait after the last filesystem event before re-reading.
const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(500);

pub struct CatalogService {
    path: PathBuf,
    snapshot: ArcSwap<CatalogSnapshot>,
    tx: broadcast::Sender<Arc<CatalogSnapshot>>,
    // Kept alive for the lifetime of the service; dropping it unregisters
    // the OS watch.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl CatalogService {
    /// Read and parse the catalog once. A missing file yields an empty
    /// catalog (the proxy starts with zero outbound servers); a malformed
    /// file is an error so startup fails loudly.
    pub fn load(path: PathBuf) -> Result<Self, ProxyError> {
        let snapshot = match std::fs::read_to_string(&path) {
            Ok(text) => parse_catalog(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("catalog {} does not exist; starting empty", path.display());
                CatalogSnapshot::default()
            }
            Err(err) => {
                return Err(ProxyError::validation(format!(
                    "failed to read catalog {}: {err}",
                    path.display()
                )));
            }
        };

        let (tx, _) = broadcast::channel(16);
        Ok(Self {
            path,
            snapshot: ArcSwap::from_pointee(snapshot),
            tx,
            watcher: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock-free access to the latest good snapshot.
    pub fn current(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CatalogSnapshot>> {
        self.tx.subscribe()
    }

    /// Start watching the catalog's parent directory. Must be called from
    /// within a Tokio runtime.
    pub fn watch(self: &Arc<Self>) -> notify::Result<()> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })?;

        let watch_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        {
            let mut guard = match self.watcher.lock() {
                Ok(guard) => guard,
                Err(err) => err.into_inner(),
            };
            *guard = Some(watcher);
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.debounce_loop(raw_rx).await;
        });
        Ok(())
    }

    // Coalesce bursts of events targeting the catalog file into a single
    // reload per debounce window.
    async fn debounce_loop(&self, mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>) {
        let mut deadline: Option<Instant> = None;

        loop {
            let timer_deadline =
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(60 * 60 * 24));
            let timer = sleep_until(timer_deadline);
            tokio::pin!(timer);

            tokio::select! {
                res = raw_rx.recv() => {
                    match res {
                        Some(Ok(event)) => {
                            if self.event_touches_catalog(&event) {
                                deadline = Some(Instant::now() + DEBOUNCE_INTERVAL);
                            }
                        }
                        Some(Err(err)) => {
                            warn!("catalog watcher error: {err}");
                        }
                        None => {
                            if deadline.is_some() {
                                self.reload();
                            }
                            break;
                        }
                    }
                }
                _ = &mut timer => {
                    if deadline.take().is_some() {
                        self.reload();
                    }
                }
            }
        }
    }

    fn event_touches_catalog(&self, event: &Event) -> bool {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }
        event.paths.iter().any(|p| {
            p == &self.path || p.file_name() == self.path.file_name()
        })
    }

    /// Re-read the catalog; on any failure the last good snapshot stays in
    /// place.
    fn reload(&self) {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) => {
                warn!("catalog reload failed: {err}; keeping previous snapshot");
                return;
            }
        };
        let parsed = match parse_catalog(&text) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("catalog reload failed: {err}; keeping previous snapshot");
                return;
            }
        };

        let previous = self.snapshot.load();
        if **previous == parsed {
            return;
        }
        let next = Arc::new(parsed);
        info!(
            "catalog changed: {} server(s) configured",
            next.servers.len()
        );
        self.snapshot.store(Arc::clone(&next));
        let _ = self.tx.send(next);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn write_catalog(path: &Path, names: &[&str]) {
        let servers: serde_json::Map<String, serde_json::Value> = names
            .iter()
            .map(|name| {
                (
                    (*name).to_string(),
                    json!({ "type": "http", "url": format!("https://{name}.example") }),
                )
            })
            .collect();
        std::fs::write(path, json!({ "mcpServers": servers }).to_string())
            .expect("write catalog");
    }

    #[test]
    fn load_reads_initial_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp.json");
        write_catalog(&path, &["a", "b"]);

        let service = CatalogService::load(path).expect("load");
        let snapshot = service.current();
        let names: Vec<&String> = snapshot.servers.keys().collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn load_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = CatalogService::load(dir.path().join("mcp.json")).expect("load");
        assert_eq!(service.current().servers.len(), 0);
    }

    #[test]
    fn load_rejects_malformed_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(CatalogService::load(path).is_err());
    }

    #[test]
    fn reload_publishes_new_snapshot_and_keeps_old_on_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp.json");
        write_catalog(&path, &["a"]);
        let service = CatalogService::load(path.clone()).expect("load");
        let mut rx = service.subscribe();

        write_catalog(&path, &["a", "c"]);
        service.reload();
        assert_eq!(service.current().servers.len(), 2);
        let published = rx.try_recv().expect("change broadcast");
        assert!(published.servers.contains_key("c"));

        // A broken rewrite must not clobber the good snapshot.
        std::fs::write(&path, "{ broken").expect("write");
        service.reload();
        assert_eq!(service.current().servers.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unchanged_reload_is_not_broadcast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp.json");
        write_catalog(&path, &["a"]);
        let service = CatalogService::load(path).expect("load");
        let mut rx = service.subscribe();
        service.reload();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn watcher_picks_up_file_rewrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcp.json");
        write_catalog(&path, &["a"]);
        let service = Arc::new(CatalogService::load(path.clone()).expect("load"));
        service.watch().expect("watch");
        let mut rx = service.subscribe();

        // Simulate an atomic-rename save: write a temp file then rename it
        // over the catalog.
        let tmp = dir.path().join("mcp.json.tmp");
        write_catalog(&tmp, &["a", "b"]);
        std::fs::rename(&tmp, &path).expect("rename");

        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change within deadline")
            .expect("broadcast recv");
        assert!(snapshot.servers.contains_key("b"));
    }
}
