//! CBOR encoding/decoding for portable entry and manifest storage
//!
//! Entry bytes are exactly the canonical hash preimage, so the address a
//! content-addressed store assigns to them equals the entry hash.
//!
//! Manifest format:
//! - Magic: `CUBESNAP` (8 bytes)
//! - Version: u16 (little-endian)
//! - Payload: CBOR array `[heads, entry_count, max_clock]`

use std::collections::{BTreeMap, BTreeSet};

use ciborium::Value as Cbor;

use crate::error::CubeError;
use crate::hash::{build_canonical_cbor, compute_entry_hash, content_hash, SCHEMA_VERSION};
use crate::types::entry::{LogEntry, Operation};
use crate::types::ids::{EntryHash, ReplicaId};
use crate::types::value::{Document, Value};

/// Magic bytes at start of a manifest
pub const MANIFEST_MAGIC: &[u8; 8] = b"CUBESNAP";

/// Current manifest format version
pub const MANIFEST_VERSION: u16 = 1;

/// Summary of a whole log: its frontier plus enough to sanity-check a load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Head hashes in ascending order
    pub heads: BTreeSet<EntryHash>,
    pub entry_count: u64,
    pub max_clock: u64,
}

/// Encode an entry to its canonical bytes
pub fn encode_entry(entry: &LogEntry) -> Vec<u8> {
    build_canonical_cbor(
        entry.clock,
        &entry.replica_id,
        &entry.parents,
        entry.operation,
        &entry.doc_id,
        entry.payload.as_ref(),
    )
}

/// Decode canonical entry bytes, verifying the embedded fields hash to the bytes' address
pub fn decode_entry(data: &[u8]) -> Result<LogEntry, CubeError> {
    let value: Cbor = ciborium::from_reader(data)
        .map_err(|e| CubeError::Codec(format!("Failed to decode entry CBOR: {}", e)))?;

    let array = match value {
        Cbor::Array(arr) => arr,
        _ => return Err(CubeError::Codec("Expected entry array".to_string())),
    };

    if array.len() != 7 {
        return Err(CubeError::Codec(format!(
            "Expected 7 elements, got {}",
            array.len()
        )));
    }

    let mut iter = array.into_iter();
    let mut next = |name: &str| {
        iter.next()
            .ok_or_else(|| CubeError::Codec(format!("Missing {}", name)))
    };

    let schema = extract_u64(&next("schema_version")?, "schema_version")?;
    if schema != u64::from(SCHEMA_VERSION) {
        return Err(CubeError::Codec(format!(
            "Unsupported schema version: {}",
            schema
        )));
    }

    let clock = extract_u64(&next("clock")?, "clock")?;

    let replica_id: ReplicaId = extract_bytes(next("replica_id")?, "replica_id")?
        .try_into()
        .map_err(|_| CubeError::Codec("Invalid replica_id length".to_string()))?;

    let tag = extract_u64(&next("op_tag")?, "op_tag")?;
    let operation = u32::try_from(tag)
        .ok()
        .and_then(Operation::from_tag)
        .ok_or_else(|| CubeError::Codec(format!("Unknown operation tag: {}", tag)))?;

    let doc_id = match next("doc_id")? {
        Cbor::Text(s) => s,
        _ => return Err(CubeError::Codec("Invalid doc_id type".to_string())),
    };

    let payload = match next("payload")? {
        Cbor::Null => None,
        map @ Cbor::Map(_) => match cbor_to_value(map)? {
            Value::Map(fields) => Some(Document::from(fields)),
            _ => return Err(CubeError::Codec("Invalid payload type".to_string())),
        },
        _ => return Err(CubeError::Codec("Invalid payload type".to_string())),
    };

    let parents = match next("parents")? {
        Cbor::Array(items) => items
            .into_iter()
            .map(|item| {
                extract_bytes(item, "parent")?
                    .try_into()
                    .map_err(|_| CubeError::Codec("Invalid parent length".to_string()))
            })
            .collect::<Result<BTreeSet<EntryHash>, CubeError>>()?,
        _ => return Err(CubeError::Codec("Invalid parents type".to_string())),
    };

    let hash = content_hash(data);
    let recomputed = compute_entry_hash(clock, &replica_id, &parents, operation, &doc_id, payload.as_ref());
    if recomputed != hash {
        return Err(CubeError::Validation(format!(
            "entry bytes are not in canonical form ({} != {})",
            hex::encode(recomputed),
            hex::encode(hash)
        )));
    }

    Ok(LogEntry {
        hash,
        clock,
        replica_id,
        parents,
        operation,
        doc_id,
        payload,
    })
}

/// Encode a manifest
pub fn encode_manifest(manifest: &Manifest) -> Result<Vec<u8>, CubeError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MANIFEST_MAGIC);
    buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());

    let value = Cbor::Array(vec![
        Cbor::Array(
            manifest.heads.iter().map(|h| Cbor::Bytes(h.to_vec())).collect(),
        ),
        Cbor::Integer(manifest.entry_count.into()),
        Cbor::Integer(manifest.max_clock.into()),
    ]);
    ciborium::into_writer(&value, &mut buf)
        .map_err(|e| CubeError::Codec(format!("Failed to encode manifest: {}", e)))?;

    Ok(buf)
}

/// Decode a manifest
pub fn decode_manifest(data: &[u8]) -> Result<Manifest, CubeError> {
    if data.len() < 8 + 2 {
        return Err(CubeError::Codec("Manifest too small".to_string()));
    }

    if &data[0..8] != MANIFEST_MAGIC {
        return Err(CubeError::Codec("Invalid manifest magic bytes".to_string()));
    }

    let version = u16::from_le_bytes([data[8], data[9]]);
    if version != MANIFEST_VERSION {
        return Err(CubeError::Codec(format!(
            "Unsupported manifest version: {}",
            version
        )));
    }

    let value: Cbor = ciborium::from_reader(&data[10..])
        .map_err(|e| CubeError::Codec(format!("Failed to decode manifest CBOR: {}", e)))?;

    let array = match value {
        Cbor::Array(arr) if arr.len() == 3 => arr,
        _ => return Err(CubeError::Codec("Expected 3-element manifest array".to_string())),
    };
    let mut iter = array.into_iter();

    let heads = match iter.next() {
        Some(Cbor::Array(items)) => items
            .into_iter()
            .map(|item| {
                extract_bytes(item, "head")?
                    .try_into()
                    .map_err(|_| CubeError::Codec("Invalid head length".to_string()))
            })
            .collect::<Result<BTreeSet<EntryHash>, CubeError>>()?,
        _ => return Err(CubeError::Codec("Invalid heads type".to_string())),
    };
    let entry_count = match iter.next() {
        Some(v) => extract_u64(&v, "entry_count")?,
        None => return Err(CubeError::Codec("Missing entry_count".to_string())),
    };
    let max_clock = match iter.next() {
        Some(v) => extract_u64(&v, "max_clock")?,
        None => return Err(CubeError::Codec("Missing max_clock".to_string())),
    };

    Ok(Manifest {
        heads,
        entry_count,
        max_clock,
    })
}

fn cbor_to_value(value: Cbor) -> Result<Value, CubeError> {
    Ok(match value {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(b),
        Cbor::Integer(i) => {
            let n: i128 = i.into();
            Value::Integer(
                i64::try_from(n)
                    .map_err(|_| CubeError::Codec(format!("Integer out of range: {}", n)))?,
            )
        }
        Cbor::Float(f) => Value::Float(f),
        Cbor::Text(s) => Value::String(s),
        Cbor::Array(items) => Value::List(
            items.into_iter().map(cbor_to_value).collect::<Result<_, _>>()?,
        ),
        Cbor::Map(pairs) => {
            let mut map = BTreeMap::new();
            for (k, v) in pairs {
                let key = match k {
                    Cbor::Text(s) => s,
                    _ => return Err(CubeError::Codec("Map keys must be text".to_string())),
                };
                map.insert(key, cbor_to_value(v)?);
            }
            Value::Map(map)
        }
        other => {
            return Err(CubeError::Codec(format!("Unsupported CBOR value: {:?}", other)))
        }
    })
}

fn extract_bytes(value: Cbor, field: &str) -> Result<Vec<u8>, CubeError> {
    match value {
        Cbor::Bytes(b) => Ok(b),
        _ => Err(CubeError::Codec(format!("Expected bytes for {}", field))),
    }
}

fn extract_u64(value: &Cbor, field: &str) -> Result<u64, CubeError> {
    match value {
        Cbor::Integer(i) => {
            let n: i128 = (*i).into();
            u64::try_from(n).map_err(|_| CubeError::Codec(format!("{} out of range", field)))
        }
        _ => Err(CubeError::Codec(format!("Expected integer for {}", field))),
    }
}
