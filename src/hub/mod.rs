//! Connection hub
//!
//! Brings the relay up in a fixed order, holds every running component, and
//! tears them down again on a termination signal or when the last tool
//! consumer leaves.

pub mod election;
pub mod ipc;
pub mod registry;
pub mod shutdown;
pub mod socket;

pub use registry::ExtensionRegistry;

use crate::assets::{self, AssetServer, AssetServerState, AssetStore};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::pending::PendingCalls;
use crate::tools::{build_catalog, ToolPipeline};
use ipc::IpcChannel;
use socket::SocketChannel;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A started relay.
pub struct RunningHub {
    config: RelayConfig,
    store: Arc<AssetStore>,
    pending: PendingCalls,
    registry: Arc<ExtensionRegistry>,
    asset_server: AssetServer,
    ipc: IpcChannel,
    socket: SocketChannel,
    sweeper: JoinHandle<()>,
    /// Stops the listeners and the sweeper
    listeners: CancellationToken,
    /// Fired by a signal, the idle trigger or [`RunningHub::request_shutdown`]
    stop: CancellationToken,
}

/// Start every component.
///
/// Order: runtime directory, stale socket removal, asset store and bridge,
/// tool pipeline, consumer listener, extension socket, asset sweeper.
pub async fn start(config: RelayConfig) -> Result<RunningHub, RelayError> {
    config.validate().map_err(RelayError::Config)?;

    fs::create_dir_all(&config.runtime_dir).map_err(|source| RelayError::RuntimeDir {
        path: config.runtime_dir.clone(),
        source,
    })?;

    let socket_path = config.socket_path();
    ipc::remove_stale_socket(&socket_path)?;

    let store = Arc::new(AssetStore::open(&config.asset_dir).map_err(RelayError::AssetStore)?);
    log::info!(
        "Asset store at {} ({} cached)",
        store.root().display(),
        store.len()
    );
    let asset_server = assets::start_asset_server(
        AssetServerState {
            store: store.clone(),
            max_asset_bytes: config.max_asset_bytes,
        },
        CancellationToken::new(),
    )
    .await?;

    let pending = PendingCalls::new();
    let registry = ExtensionRegistry::new(pending.clone(), config.auto_activate_grace());
    let pipeline = Arc::new(ToolPipeline::new(
        build_catalog(config.expose_debug_tools),
        registry.clone(),
        pending.clone(),
        store.clone(),
        asset_server.url(),
        config.tool_call_timeout(),
    ));

    let listeners = CancellationToken::new();
    let stop = CancellationToken::new();

    let ipc_listener = match ipc::bind_ipc(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            asset_server.stop();
            return Err(e);
        }
    };
    let ipc = ipc::start_ipc_channel(
        ipc_listener,
        socket_path.clone(),
        pipeline,
        registry.clone(),
        config.exit_when_idle.then(|| stop.clone()),
        listeners.clone(),
    );

    let (socket_listener, port) = match socket::bind_first_available(&config.port_candidates).await
    {
        Ok(bound) => bound,
        Err(e) => {
            listeners.cancel();
            asset_server.stop();
            remove_socket_file(&socket_path);
            return Err(e);
        }
    };
    registry.set_endpoints(port, asset_server.url());
    let socket = socket::start_socket_channel(
        socket_listener,
        port,
        registry.clone(),
        config.max_message_bytes,
        listeners.clone(),
    );

    let sweeper = assets::spawn_ttl_sweeper(
        store.clone(),
        config.asset_ttl(),
        config.asset_sweep_interval(),
        listeners.clone(),
    );

    log::info!(
        "Relay ready: consumers at {}, extensions on port {}, assets at {}",
        socket_path.display(),
        port,
        asset_server.url()
    );

    Ok(RunningHub {
        config,
        store,
        pending,
        registry,
        asset_server,
        ipc,
        socket,
        sweeper,
        listeners,
        stop,
    })
}

impl RunningHub {
    pub fn socket_port(&self) -> u16 {
        self.socket.port()
    }

    pub fn asset_url(&self) -> String {
        self.asset_server.url()
    }

    pub fn socket_path(&self) -> &Path {
        self.ipc.path()
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }

    /// Token fired when the relay should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn request_shutdown(&self) {
        self.stop.cancel();
    }

    /// Run until a signal, the idle trigger or a shutdown request, then shut
    /// down.
    pub async fn run_until_shutdown(self) -> Result<(), RelayError> {
        shutdown::spawn_signal_listener(self.stop.clone());
        self.stop.cancelled().await;
        self.shutdown().await
    }

    /// Flush the asset index, stop the bridge, close both listeners and
    /// reject outstanding calls. Fails if the components do not finish
    /// within the configured grace period.
    pub async fn shutdown(self) -> Result<(), RelayError> {
        log::info!("Shutting down relay...");
        self.stop.cancel();

        if let Err(e) = self.store.flush() {
            log::warn!("{}", e);
        }
        self.asset_server.stop();
        self.listeners.cancel();
        self.registry.close_all();
        let rejected = self.pending.cleanup_all();
        if rejected > 0 {
            log::info!("Rejected {} outstanding tool call(s)", rejected);
        }

        let socket_path: PathBuf = self.ipc.path().to_path_buf();
        let grace = self.config.shutdown_grace();
        let RunningHub {
            store,
            asset_server,
            ipc,
            socket,
            sweeper,
            ..
        } = self;

        let joined = tokio::time::timeout(grace, async move {
            asset_server.join().await;
            ipc.join().await;
            socket.join().await;
            if let Err(e) = sweeper.await {
                log::warn!("Asset sweeper ended abnormally: {}", e);
            }
        })
        .await;

        remove_socket_file(&socket_path);
        // Uploads that finished during the drain
        if let Err(e) = store.flush() {
            log::warn!("{}", e);
        }

        match joined {
            Ok(()) => {
                log::info!("Relay stopped");
                Ok(())
            }
            Err(_) => Err(RelayError::ShutdownTimeout(grace.as_millis() as u64)),
        }
    }
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove socket file {}: {}", path.display(), e);
        }
    }
}
