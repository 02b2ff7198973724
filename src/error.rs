//! Error types for the relay
//!
//! `CallError` is the closed set of outcomes for a call forwarded to an
//! extension. `RelayError` covers startup, bind and shutdown failures that
//! end the process.

use std::path::PathBuf;
use thiserror::Error;

/// Why a forwarded tool call did not produce a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No reply arrived within the configured duration
    #[error("Tool call timed out after {0} ms")]
    Timeout(u64),
    /// The owning extension connection closed before replying
    #[error("Extension disconnected before replying")]
    Disconnected,
    /// The relay is shutting down
    #[error("Relay is shutting down")]
    Shutdown,
    /// No extension is currently active
    #[error("No active extension. Open the plugin in the design editor and make sure it is connected.")]
    NoActiveExtension,
    /// The outbound message could not be queued for the extension
    #[error("Failed to send tool call to extension")]
    SendFailed,
    /// The extension replied with an error
    #[error("Extension error: {0}")]
    Extension(String),
}

impl CallError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            CallError::Timeout(_) => error_codes::CALL_TIMEOUT,
            CallError::Disconnected => error_codes::EXTENSION_DISCONNECTED,
            CallError::Shutdown => error_codes::SHUTTING_DOWN,
            CallError::NoActiveExtension => error_codes::NO_ACTIVE_EXTENSION,
            CallError::SendFailed => error_codes::SEND_FAILED,
            CallError::Extension(_) => error_codes::EXTENSION_ERROR,
        }
    }
}

/// Fatal relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to prepare runtime directory {path}: {source}")]
    RuntimeDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to bind IPC listener at {path}: {source}")]
    IpcBind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to bind socket channel on port {port}: {source}")]
    SocketBind { port: u16, source: std::io::Error },

    #[error("All socket channel ports are in use: {0:?}")]
    PortsExhausted(Vec<u16>),

    #[error("Failed to start asset server: {0}")]
    AssetServer(std::io::Error),

    #[error("Asset store error: {0}")]
    AssetStore(String),

    #[error("Shutdown did not finish within {0} ms")]
    ShutdownTimeout(u64),
}

/// Error code constants
pub mod error_codes {
    pub const CALL_TIMEOUT: &str = "CALL_TIMEOUT";
    pub const EXTENSION_DISCONNECTED: &str = "EXTENSION_DISCONNECTED";
    pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";
    pub const NO_ACTIVE_EXTENSION: &str = "NO_ACTIVE_EXTENSION";
    pub const SEND_FAILED: &str = "SEND_FAILED";
    pub const EXTENSION_ERROR: &str = "EXTENSION_ERROR";
    pub const INVALID_ARGUMENTS: &str = "INVALID_ARGUMENTS";
    pub const UNKNOWN_TOOL: &str = "UNKNOWN_TOOL";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}
