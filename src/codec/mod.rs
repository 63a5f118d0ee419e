//! Attribute value codecs.
//!
//! The store only ever sees opaque byte payloads; the codec decides how an
//! [`AttributeValue`] becomes bytes. The codec is injected into the
//! replication client so every process sharing a cluster can agree on one.

use crate::core::{AttributeValue, Payload, Result, SessionError};

/// Converts attribute values to and from stored payloads.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &AttributeValue) -> Result<Payload>;

    fn decode(&self, payload: &[u8]) -> Result<AttributeValue>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// MessagePack payloads (rmp-serde). This is the default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl ValueCodec for MessagePackCodec {
    fn encode(&self, value: &AttributeValue) -> Result<Payload> {
        Ok(rmp_serde::to_vec(value)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<AttributeValue> {
        if payload.is_empty() {
            return Err(SessionError::Serialization(
                "empty MessagePack payload".to_string(),
            ));
        }
        Ok(rmp_serde::from_slice(payload)?)
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}

/// JSON payloads, handy when other tooling needs to read the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &AttributeValue) -> Result<Payload> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<AttributeValue> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
