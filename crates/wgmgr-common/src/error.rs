//! Error types for wgmgr operations.
//!
//! All errors implement `std::error::Error` via `thiserror`. The taxonomy
//! follows how the daemon reacts to them: fatal configuration errors stop
//! startup, everything else is logged and retried on the next pass.

use std::io;
use thiserror::Error;

/// Result type alias for wgmgr operations.
pub type WgMgrResult<T> = Result<T, WgMgrError>;

/// Errors that can occur while reconciling tunnel and firewall state.
#[derive(Debug, Error)]
pub enum WgMgrError {
    /// Failed to spawn a shell command.
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The setting that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// A configured WireGuard interface could not be opened at startup.
    #[error("WireGuard interface '{interface}' is not available: {message}")]
    DeviceNotFound { interface: String, message: String },

    /// Reading or configuring a WireGuard interface failed.
    #[error("WireGuard interface '{interface}': {message}")]
    Device { interface: String, message: String },

    /// The managed firewall chain does not exist.
    #[error("an {family} chain named {chain} does not exist in table {table}")]
    ChainNotFound {
        family: String,
        table: String,
        chain: String,
    },

    /// A named ipset used as DNAT destination does not exist.
    #[error("an ipset named {0} does not exist")]
    IpSetNotFound(String),

    /// Fetching the desired peer list failed.
    #[error("API request failed: {0}")]
    Api(String),

    /// Event channel connection failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl WgMgrError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a device access error.
    pub fn device(interface: impl Into<String>, message: impl ToString) -> Self {
        Self::Device {
            interface: interface.into(),
            message: message.to_string(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates misconfiguration that should
    /// abort startup rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WgMgrError::InvalidConfig { .. }
                | WgMgrError::DeviceNotFound { .. }
                | WgMgrError::ChainNotFound { .. }
                | WgMgrError::IpSetNotFound(_)
        )
    }
}
