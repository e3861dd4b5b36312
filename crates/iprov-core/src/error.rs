//! Provider error types with fatal/recoverable classification

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Provider error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {message}")]
    Http { message: String },

    // ─────────────────────────────────────────────────────────────
    // Process Supervision Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Required binary not found: {path}")]
    BinaryMissing { path: PathBuf },

    #[error("Process error: {message}")]
    Process { message: String },

    // ─────────────────────────────────────────────────────────────
    // Bridge / Backend Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Bridge error: {message}")]
    Bridge { message: String },

    #[error("Tunnel failed: {message}")]
    Tunnel { message: String },

    #[error("Automation agent cannot run: {message}")]
    AgentFatal { message: String },

    // ─────────────────────────────────────────────────────────────
    // Streaming Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Stream error: {message}")]
    Stream { message: String },

    #[error("SP protocol error: {message}")]
    Protocol { message: String },

    #[error("{channel} connection lost")]
    ConnectionLost { channel: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("Port pool {min}-{max} exhausted")]
    PortsExhausted { min: u16, max: u16 },

    // ─────────────────────────────────────────────────────────────
    // Control Floor Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Control floor error: {message}")]
    ControlFloor { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    pub fn binary_missing(path: impl Into<PathBuf>) -> Self {
        Self::BinaryMissing { path: path.into() }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn bridge(message: impl Into<String>) -> Self {
        Self::Bridge {
            message: message.into(),
        }
    }

    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel {
            message: message.into(),
        }
    }

    pub fn agent_fatal(message: impl Into<String>) -> Self {
        Self::AgentFatal {
            message: message.into(),
        }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn connection_lost(channel: impl Into<String>) -> Self {
        Self::ConnectionLost {
            channel: channel.into(),
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn control_floor(message: impl Into<String>) -> Self {
        Self::ControlFloor {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Http { .. }
                | Error::Process { .. }
                | Error::Bridge { .. }
                | Error::Tunnel { .. }
                | Error::Stream { .. }
                | Error::Protocol { .. }
                | Error::ConnectionLost { .. }
                | Error::ControlFloor { .. }
        )
    }

    /// Check if this error should terminate the whole provider
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BinaryMissing { .. }
                | Error::AgentFatal { .. }
                | Error::ConfigInvalid { .. }
                | Error::PortsExhausted { .. }
        )
    }
}
