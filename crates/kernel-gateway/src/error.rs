//! Error types for the gateway's module seams.

use std::time::Duration;

use jupyter_wire::{Channel, WireError};

/// Invalid configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be a dotted Python identifier, got {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("unknown session mode {0:?} (expected console, notebook, background or 0-2)")]
    UnknownSessionMode(String),
}

/// Failures talking to a kernel channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("socket error: {0}")]
    Socket(#[from] zeromq::ZmqError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("{0} is receive-only")]
    ReceiveOnly(Channel),

    #[error("{0} worker is not running")]
    Closed(Channel),
}

/// Fatal failures while bringing the gateway up.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to launch kernel: {0:#}")]
    Launch(anyhow::Error),

    #[error("kernel did not become ready within {0:?}")]
    NotReady(Duration),

    #[error("kernel channel setup failed: {0}")]
    Channel(#[from] ChannelError),

    #[error("failed to bind {endpoint} endpoint on {addr}: {source}")]
    Bind {
        endpoint: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("gateway was stopped")]
    Stopped,
}

/// Non-fatal failures installing auxiliary services in the kernel.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("no execute_reply within {0:?}")]
    Timeout(Duration),

    #[error("registration code raised {ename}: {evalue}")]
    Failed { ename: String, evalue: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("gateway was stopped")]
    Stopped,
}
