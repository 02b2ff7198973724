pub mod assets;
pub mod config;
pub mod error;
pub mod hub;
pub mod pending;
pub mod protocol;
pub mod tools;

pub use config::RelayConfig;
pub use error::{CallError, RelayError};

/// Start the relay and block until it has shut down.
pub async fn run(config: RelayConfig) -> Result<(), RelayError> {
    let hub = hub::start(config).await?;
    hub.run_until_shutdown().await
}
