//! Opaque Jupyter message types for kernel gateways.
//!
//! This crate carries Jupyter messages between a kernel's ZeroMQ channels and
//! JSON-speaking clients without interpreting them.
//!
//! # Features
//!
//! - `Message`: header/parent header/metadata plus a schema-less `content`
//!   value that is passed through untouched
//! - Base64 encoding/decoding for binary buffers in JSON transport
//! - Timestamp normalization to ISO-8601 strings
//! - Multipart ZeroMQ wire codec with HMAC-SHA256 signing

mod base64;
mod message;
pub mod timestamp;
pub mod wire;

pub use base64::{deserialize_buffers, serialize_buffers};
pub use message::{Channel, Header, Message, PROTOCOL_VERSION};
pub use wire::{Routed, Signer, WireError};
