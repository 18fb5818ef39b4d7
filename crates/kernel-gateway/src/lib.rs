//! kernel-gateway - WebSocket access to a Jupyter kernel
//!
//! Editor clients that only speak WebSocket/JSON connect to two endpoints:
//! the shell endpoint carries shell, iopub and stdin traffic, and the
//! control endpoint carries interrupts and shutdowns on a path of its own so
//! they are never stuck behind shell output.
//!
//! ```text
//! kernel ─zmq─> channel worker ─> group queue ─> broadcaster ─> client outboxes ─ws─> clients
//! clients ─ws─> connection task ─> route ─> channel worker ─zmq─> kernel
//! ```
//!
//! Message content is never interpreted; it is carried through verbatim.

pub mod broadcast;
pub mod channels;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod kernel;
pub mod queue;
pub mod services;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use config::{GatewayConfig, KernelConfig, KernelSource, RegistrationConfig, SessionMode};
pub use error::{ChannelError, ConfigError, RegistrationError, StartupError};
pub use gateway::Gateway;
pub use queue::Group;
pub use shutdown::StopSignal;
