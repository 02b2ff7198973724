//! Asset cache and its HTTP transfer bridge

pub mod server;
pub mod store;

pub use server::{router, start_asset_server, AssetServer, AssetServerState};
pub use store::{is_valid_hash, AssetRecord, AssetStore, RemoveOptions};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Periodically drop assets untouched for longer than `ttl`.
///
/// Best effort: the first sweep runs one `interval` after start.
pub fn spawn_ttl_sweeper(
    store: Arc<AssetStore>,
    ttl: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    store.sweep_expired(Utc::now(), ttl);
                    if let Err(e) = store.flush() {
                        log::warn!("{}", e);
                    }
                }
            }
        }
        log::debug!("Asset sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweeper_drops_stale_assets() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(AssetStore::open(temp.path()).unwrap());
        let path = store.path_for("stale00001");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"png").unwrap();
        store.upsert(AssetRecord {
            hash: "stale00001".to_string(),
            file_path: path.clone(),
            mime_type: "image/png".to_string(),
            size: 3,
            last_touched: Utc::now() - chrono::Duration::minutes(1),
            width: None,
            height: None,
        });

        let token = CancellationToken::new();
        let sweeper = spawn_ttl_sweeper(
            store.clone(),
            Duration::from_millis(1),
            Duration::from_millis(20),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!store.has("stale00001"));
        assert!(!path.exists());

        token.cancel();
        sweeper.await.unwrap();
    }
}
