//! Canonical object encoding.
//!
//! Every object is stored as `<kind> <payload-len>\0<payload>`. Blob payloads
//! are the raw bytes; trees, commits and tags are JSON. The [`ObjectId`] is
//! the SHA-256 of the whole encoding, so identical content always lands on
//! the same id.

use serde::Serialize;

use crate::error::StoreError;
use crate::types::{Object, ObjectId, ObjectKind};

/// Encode an object into its canonical byte form.
///
/// # Errors
/// Returns [`StoreError::Corrupt`] if a structured payload fails to serialize.
pub fn encode(object: &Object) -> Result<Vec<u8>, StoreError> {
    let payload = match object {
        Object::Blob(bytes) => return Ok(frame(ObjectKind::Blob, bytes)),
        Object::Tree(tree) => to_json(tree)?,
        Object::Commit(commit) => to_json(commit)?,
        Object::Tag(tag) => to_json(tag)?,
    };
    Ok(frame(object.kind(), &payload))
}

/// Encode an object and compute its id.
///
/// # Errors
/// See [`encode`].
pub fn encode_with_id(object: &Object) -> Result<(ObjectId, Vec<u8>), StoreError> {
    let bytes = encode(object)?;
    Ok((ObjectId::hash_encoded(&bytes), bytes))
}

/// The id `object` would be stored under.
///
/// # Errors
/// See [`encode`].
pub fn object_id(object: &Object) -> Result<ObjectId, StoreError> {
    match object {
        Object::Blob(bytes) => Ok(ObjectId::for_blob(bytes)),
        other => encode_with_id(other).map(|(oid, _)| oid),
    }
}

/// Decode a canonical encoding back into an object.
///
/// # Errors
/// Returns [`StoreError::Corrupt`] if the header is malformed, the length
/// does not match, or a structured payload fails to parse.
pub fn decode(bytes: &[u8]) -> Result<Object, StoreError> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| StoreError::corrupt("object", "missing header terminator"))?;
    let header = std::str::from_utf8(&bytes[..nul])
        .map_err(|e| StoreError::corrupt("object header", e))?;
    let (kind, len) = header
        .split_once(' ')
        .ok_or_else(|| StoreError::corrupt("object header", format!("malformed header {header:?}")))?;
    let kind = ObjectKind::from_token(kind)
        .ok_or_else(|| StoreError::corrupt("object header", format!("unknown kind {kind:?}")))?;
    let len: usize = len
        .parse()
        .map_err(|e| StoreError::corrupt("object header", e))?;
    let payload = &bytes[nul + 1..];
    if payload.len() != len {
        return Err(StoreError::corrupt(
            "object",
            format!("header says {len} bytes, payload has {}", payload.len()),
        ));
    }
    let object = match kind {
        ObjectKind::Blob => Object::Blob(payload.to_vec()),
        ObjectKind::Tree => Object::Tree(from_json(kind, payload)?),
        ObjectKind::Commit => Object::Commit(from_json(kind, payload)?),
        ObjectKind::Tag => Object::Tag(from_json(kind, payload)?),
    };
    Ok(object)
}

fn frame(kind: ObjectKind, payload: &[u8]) -> Vec<u8> {
    let header = format!("{kind} {}\0", payload.len());
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::corrupt("object payload", e))
}

fn from_json<T: serde::de::DeserializeOwned>(
    kind: ObjectKind,
    payload: &[u8],
) -> Result<T, StoreError> {
    serde_json::from_slice(payload).map_err(|e| StoreError::corrupt(format!("{kind} payload"), e))
}
