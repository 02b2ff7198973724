//! Tool consumer channel
//!
//! Unix domain socket listener. Every accepted connection is an independent
//! MCP session sharing the relay's tool pipeline. The registry's consumer
//! count follows the live sessions, and when it falls back to zero the relay
//! can be asked to exit.

use super::registry::ExtensionRegistry;
use crate::error::RelayError;
use crate::tools::{RelayMcpServer, ToolPipeline};
use rmcp::ServiceExt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Remove a socket file left behind by a previous run.
pub fn remove_stale_socket(path: &Path) -> Result<(), RelayError> {
    match fs::remove_file(path) {
        Ok(()) => {
            log::info!("Removed stale socket file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RelayError::IpcBind {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Bind the consumer listener at `path`.
pub fn bind_ipc(path: &Path) -> Result<UnixListener, RelayError> {
    UnixListener::bind(path).map_err(|source| RelayError::IpcBind {
        path: path.to_path_buf(),
        source,
    })
}

/// Running consumer channel.
pub struct IpcChannel {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl IpcChannel {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the accept loop and every session to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::warn!("IPC channel task ended abnormally: {}", e);
        }
    }
}

/// Accept consumer connections until `shutdown` fires.
///
/// When `on_idle` is given it is cancelled the moment the last live session
/// ends.
pub fn start_ipc_channel(
    listener: UnixListener,
    path: PathBuf,
    pipeline: Arc<ToolPipeline>,
    registry: Arc<ExtensionRegistry>,
    on_idle: Option<CancellationToken>,
    shutdown: CancellationToken,
) -> IpcChannel {
    log::info!("Tool consumer socket listening at {}", path.display());

    let task = tokio::spawn(async move {
        let mut next_session: u64 = 0;
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        next_session += 1;
                        let session_id = format!("consumer-{}", next_session);
                        let count = registry.consumer_connected();
                        log::info!("Consumer {} connected ({} live)", session_id, count);

                        let server = RelayMcpServer::new(pipeline.clone(), session_id);
                        let registry = registry.clone();
                        let on_idle = on_idle.clone();
                        let token = shutdown.child_token();
                        sessions.spawn(async move {
                            let session_id = server.session_id().to_string();
                            serve_session(stream, server, token).await;

                            let remaining = registry.consumer_disconnected();
                            log::info!("Consumer {} disconnected ({} live)", session_id, remaining);
                            if remaining == 0 {
                                if let Some(on_idle) = on_idle {
                                    log::info!("Last tool consumer left");
                                    on_idle.cancel();
                                }
                            }
                        });
                    }
                    Err(e) => log::warn!("Failed to accept consumer connection: {}", e),
                },
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = result {
                        log::warn!("Consumer session task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                log::warn!("Consumer session task failed: {}", e);
            }
        }
        log::debug!("IPC channel stopped");
    });

    IpcChannel { path, task }
}

async fn serve_session(stream: UnixStream, server: RelayMcpServer, token: CancellationToken) {
    let session_id = server.session_id().to_string();
    let (read_half, write_half) = stream.into_split();

    let service = match server.serve_with_ct((read_half, write_half), token).await {
        Ok(service) => service,
        Err(e) => {
            log::warn!("MCP handshake with {} failed: {}", session_id, e);
            return;
        }
    };

    if let Err(e) = service.waiting().await {
        log::warn!("MCP session {} ended with error: {}", session_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetStore;
    use crate::pending::PendingCalls;
    use crate::tools::build_catalog;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_remove_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.sock");

        // Missing file is fine
        remove_stale_socket(&path).unwrap();

        fs::write(&path, b"").unwrap();
        remove_stale_socket(&path).unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_idle_after_last_consumer_leaves() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AssetStore::open(dir.path().join("assets")).unwrap());
        let pending = PendingCalls::new();
        let registry = ExtensionRegistry::new(pending.clone(), Duration::from_secs(60));
        let pipeline = Arc::new(ToolPipeline::new(
            build_catalog(false),
            registry.clone(),
            pending,
            store,
            String::new(),
            Duration::from_secs(1),
        ));

        let path = dir.path().join("relay.sock");
        let listener = bind_ipc(&path).unwrap();
        let idle = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let channel = start_ipc_channel(
            listener,
            path.clone(),
            pipeline,
            registry.clone(),
            Some(idle.clone()),
            shutdown.clone(),
        );

        // Connect and hang up before the MCP handshake
        let stream = UnixStream::connect(&path).await.unwrap();
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), idle.cancelled())
            .await
            .unwrap();
        assert_eq!(registry.consumer_count(), 0);

        shutdown.cancel();
        channel.join().await;
    }
}
