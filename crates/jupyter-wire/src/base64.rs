//! Binary buffers of a [`Message`](crate::Message) in its JSON form.
//!
//! Over ZeroMQ each buffer is a raw frame after the content. In JSON they
//! travel as an array of standard base64 strings on the `buffers` field.

use std::fmt;

use base64::prelude::*;
use bytes::Bytes;
use serde::de::{self, Error as _, SeqAccess, Visitor};
use serde::{Deserializer, Serializer};

/// Write buffers as an array of base64 strings.
pub fn serialize_buffers<S>(buffers: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(buffers.iter().map(|buffer| BASE64_STANDARD.encode(buffer)))
}

/// Read an array of base64 strings back into buffers.
///
/// `null` and a missing field both yield no buffers. A buffer that is not
/// valid base64 fails the whole message and the error names its position.
pub fn deserialize_buffers<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_option(BuffersVisitor)
}

struct BuffersVisitor;

impl<'de> Visitor<'de> for BuffersVisitor {
    type Value = Vec<Bytes>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of base64 strings or null")
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Vec::new())
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Vec::new())
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut buffers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(encoded) = seq.next_element::<String>()? {
            let decoded = BASE64_STANDARD.decode(&encoded).map_err(|e| {
                A::Error::custom(format!("buffer {} is not valid base64: {}", buffers.len(), e))
            })?;
            buffers.push(Bytes::from(decoded));
        }
        Ok(buffers)
    }
}
