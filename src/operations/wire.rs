//! Binary wire records for session operations and session state.
//!
//! Every record starts with `(factory_id, type_id)` so the store can dispatch
//! without knowing native types. Layout after the header:
//!
//! ```text
//! GetAttribute        attributeName:string ownerId:string
//! GetAttributeNames   ownerId:string
//! UpdateAttributes    ownerId:string count:i32 (name:string value:bytes|null)*
//! DeleteSession       ownerId:string invalidate:bool
//! GetSessionState     ownerId:string
//! AdjustOwnerCount    increment:bool
//! SessionState        ownerCount:i32 owner:string* referenceCount:i32
//!                     attributeCount:i32 (name:string value:bytes)*
//! ```
//!
//! Integers are big-endian. Strings and byte payloads are `i32` length
//! prefixed; a payload length of `-1` encodes null.

use super::operation::SessionOperation;
use super::state::SessionState;
use crate::core::{Payload, Result, SessionError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

pub const SESSION_FACTORY_ID: i32 = 1001;

pub const SESSION_STATE_TYPE: i32 = 1;
pub const GET_ATTRIBUTE_TYPE: i32 = 2;
pub const GET_ATTRIBUTE_NAMES_TYPE: i32 = 3;
pub const UPDATE_ATTRIBUTES_TYPE: i32 = 4;
pub const DELETE_SESSION_TYPE: i32 = 5;
pub const GET_SESSION_STATE_TYPE: i32 = 6;
pub const ADJUST_OWNER_COUNT_TYPE: i32 = 7;

const NULL_LENGTH: i32 = -1;

/// A decoded wire record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRecord {
    Operation(SessionOperation),
    State(SessionState),
}

impl SessionOperation {
    pub fn type_id(&self) -> i32 {
        match self {
            Self::GetSessionState { .. } => GET_SESSION_STATE_TYPE,
            Self::GetAttribute { .. } => GET_ATTRIBUTE_TYPE,
            Self::GetAttributeNames { .. } => GET_ATTRIBUTE_NAMES_TYPE,
            Self::UpdateAttributes { .. } => UPDATE_ATTRIBUTES_TYPE,
            Self::DeleteSession { .. } => DELETE_SESSION_TYPE,
            Self::AdjustOwnerCount { .. } => ADJUST_OWNER_COUNT_TYPE,
        }
    }
}

pub fn encode_operation(operation: &SessionOperation) -> Bytes {
    let mut out = BytesMut::with_capacity(64);
    out.put_i32(SESSION_FACTORY_ID);
    out.put_i32(operation.type_id());
    match operation {
        SessionOperation::GetAttribute {
            attribute_name,
            owner_id,
        } => {
            put_string(&mut out, attribute_name);
            put_string(&mut out, owner_id);
        }
        SessionOperation::GetAttributeNames { owner_id }
        | SessionOperation::GetSessionState { owner_id } => {
            put_string(&mut out, owner_id);
        }
        SessionOperation::UpdateAttributes { owner_id, updates } => {
            put_string(&mut out, owner_id);
            out.put_i32(updates.len() as i32);
            for (name, value) in updates {
                put_string(&mut out, name);
                put_payload(&mut out, value.as_deref());
            }
        }
        SessionOperation::DeleteSession {
            owner_id,
            invalidate,
        } => {
            put_string(&mut out, owner_id);
            out.put_u8(u8::from(*invalidate));
        }
        SessionOperation::AdjustOwnerCount { increment } => {
            out.put_u8(u8::from(*increment));
        }
    }
    out.freeze()
}

pub fn encode_state(state: &SessionState) -> Bytes {
    let mut out = BytesMut::with_capacity(64);
    out.put_i32(SESSION_FACTORY_ID);
    out.put_i32(SESSION_STATE_TYPE);
    out.put_i32(state.owners.len() as i32);
    for owner in &state.owners {
        put_string(&mut out, owner);
    }
    out.put_i32(state.reference_count);
    out.put_i32(state.attributes.len() as i32);
    for (name, value) in &state.attributes {
        put_string(&mut out, name);
        put_payload(&mut out, Some(value.as_slice()));
    }
    out.freeze()
}

/// Decodes any record, dispatching once on `(factory_id, type_id)`.
pub fn decode_record(bytes: &[u8]) -> Result<WireRecord> {
    let mut reader = WireReader::new(bytes);
    let factory_id = reader.i32()?;
    if factory_id != SESSION_FACTORY_ID {
        return Err(SessionError::InvalidRecord(format!(
            "unknown factory id {}",
            factory_id
        )));
    }
    let type_id = reader.i32()?;
    let record = match type_id {
        SESSION_STATE_TYPE => WireRecord::State(read_state(&mut reader)?),
        GET_ATTRIBUTE_TYPE => {
            let attribute_name = reader.string()?;
            let owner_id = reader.string()?;
            WireRecord::Operation(SessionOperation::GetAttribute {
                attribute_name,
                owner_id,
            })
        }
        GET_ATTRIBUTE_NAMES_TYPE => WireRecord::Operation(SessionOperation::GetAttributeNames {
            owner_id: reader.string()?,
        }),
        UPDATE_ATTRIBUTES_TYPE => {
            let owner_id = reader.string()?;
            let count = reader.count()?;
            let mut updates = BTreeMap::new();
            for _ in 0..count {
                let name = reader.string()?;
                let value = reader.payload()?;
                updates.insert(name, value);
            }
            WireRecord::Operation(SessionOperation::UpdateAttributes { owner_id, updates })
        }
        DELETE_SESSION_TYPE => {
            let owner_id = reader.string()?;
            let invalidate = reader.bool()?;
            WireRecord::Operation(SessionOperation::DeleteSession {
                owner_id,
                invalidate,
            })
        }
        GET_SESSION_STATE_TYPE => WireRecord::Operation(SessionOperation::GetSessionState {
            owner_id: reader.string()?,
        }),
        ADJUST_OWNER_COUNT_TYPE => WireRecord::Operation(SessionOperation::AdjustOwnerCount {
            increment: reader.bool()?,
        }),
        other => {
            return Err(SessionError::InvalidRecord(format!(
                "unknown type id {} for factory {}",
                other, factory_id
            )));
        }
    };
    reader.finish()?;
    Ok(record)
}

pub fn decode_operation(bytes: &[u8]) -> Result<SessionOperation> {
    match decode_record(bytes)? {
        WireRecord::Operation(operation) => Ok(operation),
        WireRecord::State(_) => Err(SessionError::InvalidRecord(
            "expected an operation record, found session state".to_string(),
        )),
    }
}

pub fn decode_state(bytes: &[u8]) -> Result<SessionState> {
    match decode_record(bytes)? {
        WireRecord::State(state) => Ok(state),
        WireRecord::Operation(operation) => Err(SessionError::InvalidRecord(format!(
            "expected session state, found {} operation",
            operation.kind()
        ))),
    }
}

fn read_state(reader: &mut WireReader<'_>) -> Result<SessionState> {
    let mut state = SessionState::default();
    let owner_count = reader.count()?;
    for _ in 0..owner_count {
        state.owners.insert(reader.string()?);
    }
    state.reference_count = reader.i32()?;
    let attribute_count = reader.count()?;
    for _ in 0..attribute_count {
        let name = reader.string()?;
        let value = reader.payload()?.ok_or_else(|| {
            SessionError::InvalidRecord(format!("null value stored for attribute '{}'", name))
        })?;
        state.attributes.insert(name, value);
    }
    Ok(state)
}

fn put_string(out: &mut BytesMut, value: &str) {
    out.put_i32(value.len() as i32);
    out.put_slice(value.as_bytes());
}

fn put_payload(out: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            out.put_i32(bytes.len() as i32);
            out.put_slice(bytes);
        }
        None => out.put_i32(NULL_LENGTH),
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(SessionError::InvalidRecord(format!(
                "truncated record reading {}: need {} bytes, have {}",
                what,
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    fn bool(&mut self) -> Result<bool> {
        self.need(1, "bool")?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SessionError::InvalidRecord(format!(
                "invalid bool byte {}",
                other
            ))),
        }
    }

    fn count(&mut self) -> Result<usize> {
        let count = self.i32()?;
        usize::try_from(count)
            .map_err(|_| SessionError::InvalidRecord(format!("negative count {}", count)))
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<Payload> {
        self.need(len, what)?;
        let value = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(value)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.count()?;
        let raw = self.bytes(len, "string")?;
        String::from_utf8(raw)
            .map_err(|err| SessionError::InvalidRecord(format!("invalid utf-8 string: {}", err)))
    }

    fn payload(&mut self) -> Result<Option<Payload>> {
        let len = self.i32()?;
        if len == NULL_LENGTH {
            return Ok(None);
        }
        let len = usize::try_from(len)
            .map_err(|_| SessionError::InvalidRecord(format!("invalid payload length {}", len)))?;
        self.bytes(len, "payload").map(Some)
    }

    fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(SessionError::InvalidRecord(format!(
                "{} trailing bytes after record",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
