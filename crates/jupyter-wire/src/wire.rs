//! ZeroMQ multipart framing for Jupyter messages.
//!
//! A message on the wire is:
//!
//! ```text
//! [identities..., <IDS|MSG>, signature, header, parent_header, metadata, content, buffers...]
//! ```
//!
//! The signature is an HMAC over the four JSON frames exactly as they were
//! transmitted, so verification runs on the raw bytes before anything is
//! parsed.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

use crate::message::{parent_header_from_value, Channel, Header, Message};

/// Delimiter between routing identities and the message body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

const BODY_FRAMES: usize = 5;

type HmacSha256 = Hmac<Sha256>;

/// Error type for wire encoding and decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("missing <IDS|MSG> delimiter")]
    MissingDelimiter,

    #[error("truncated message: expected {expected} frames after the delimiter, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("signature mismatch")]
    BadSignature,

    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed {part}: {source}")]
    Json {
        part: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Signs and verifies message frames with the connection's key.
///
/// An empty key disables signing, as the Jupyter protocol allows.
#[derive(Clone)]
pub struct Signer {
    mac: Option<HmacSha256>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("signed", &self.mac.is_some())
            .finish()
    }
}

impl Signer {
    /// Build a signer from a connection file's `signature_scheme` and `key`.
    pub fn new(scheme: &str, key: &str) -> Result<Self, WireError> {
        if key.is_empty() {
            return Ok(Self::unsigned());
        }
        match scheme {
            "hmac-sha256" => HmacSha256::new_from_slice(key.as_bytes())
                .map(|mac| Signer { mac: Some(mac) })
                .map_err(|_| WireError::UnsupportedScheme(scheme.to_string())),
            other => Err(WireError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn unsigned() -> Self {
        Signer { mac: None }
    }

    /// Hex-encoded signature over `parts`, or an empty string when unsigned.
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.mac {
            Some(mac) => {
                let mut mac = mac.clone();
                for part in parts {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
            None => String::new(),
        }
    }

    /// Constant-time check of a received signature.
    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<(), WireError> {
        let Some(mac) = &self.mac else {
            return Ok(());
        };
        let expected = hex::decode(signature).map_err(|_| WireError::BadSignature)?;
        let mut mac = mac.clone();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&expected)
            .map_err(|_| WireError::BadSignature)
    }
}

/// A decoded message together with the routing identities that preceded it.
#[derive(Debug, Clone)]
pub struct Routed {
    pub identities: Vec<Bytes>,
    pub message: Message,
}

/// Encode a message for a DEALER/PUB peer (no routing identities).
pub fn encode(message: &Message, signer: &Signer) -> Result<Vec<Bytes>, WireError> {
    encode_routed(&[], message, signer)
}

/// Encode a message addressed through a ROUTER socket.
pub fn encode_routed(
    identities: &[Bytes],
    message: &Message,
    signer: &Signer,
) -> Result<Vec<Bytes>, WireError> {
    let header = to_frame("header", &message.header)?;
    let parent_header = match &message.parent_header {
        Some(parent) => to_frame("parent_header", parent)?,
        None => Bytes::from_static(b"{}"),
    };
    let metadata = to_frame("metadata", &message.metadata)?;
    let content = to_frame("content", &message.content)?;
    let signature = signer.sign(&[&header[..], &parent_header[..], &metadata[..], &content[..]]);

    let mut frames = Vec::with_capacity(identities.len() + 2 + 4 + message.buffers.len());
    frames.extend(identities.iter().cloned());
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature));
    frames.extend([header, parent_header, metadata, content]);
    frames.extend(message.buffers.iter().cloned());
    Ok(frames)
}

/// Decode a multipart message received on `channel`.
pub fn decode(frames: Vec<Bytes>, channel: Channel, signer: &Signer) -> Result<Routed, WireError> {
    let delimiter = frames
        .iter()
        .position(|frame| frame.as_ref() == DELIMITER)
        .ok_or(WireError::MissingDelimiter)?;

    let body = &frames[delimiter + 1..];
    if body.len() < BODY_FRAMES {
        return Err(WireError::Truncated {
            expected: BODY_FRAMES,
            actual: body.len(),
        });
    }

    let signature = &body[0];
    let (header, parent_header, metadata, content) = (&body[1], &body[2], &body[3], &body[4]);
    signer.verify(
        signature,
        &[&header[..], &parent_header[..], &metadata[..], &content[..]],
    )?;

    let header: Header = from_frame("header", header)?;
    let parent_header = parent_header_from_value(from_frame("parent_header", parent_header)?)
        .map_err(|source| WireError::Json {
            part: "parent_header",
            source,
        })?;
    let metadata: Value = from_frame("metadata", metadata)?;
    let content: Value = from_frame("content", content)?;
    let buffers = body[BODY_FRAMES..].to_vec();

    Ok(Routed {
        identities: frames[..delimiter].to_vec(),
        message: Message {
            header,
            parent_header,
            metadata,
            content,
            buffers,
            channel: Some(channel),
        },
    })
}

fn to_frame<T: Serialize>(part: &'static str, value: &T) -> Result<Bytes, WireError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| WireError::Json { part, source })
}

fn from_frame<T: serde::de::DeserializeOwned>(
    part: &'static str,
    frame: &[u8],
) -> Result<T, WireError> {
    serde_json::from_slice(frame).map_err(|source| WireError::Json { part, source })
}
