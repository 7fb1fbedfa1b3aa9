use std::collections::BTreeSet;

use blake2::{Blake2b, Digest};
use blake2::digest::consts::U32;
use ciborium::Value as Cbor;

use crate::types::entry::Operation;
use crate::types::ids::{EntryHash, ReplicaId};
use crate::types::value::{Document, Value};

/// Schema version for entry hashing
pub const SCHEMA_VERSION: u8 = 1;

/// Compute an entry hash from its fields using canonical CBOR + BLAKE2b-256
pub fn compute_entry_hash(
    clock: u64,
    replica_id: &ReplicaId,
    parents: &BTreeSet<EntryHash>,
    operation: Operation,
    doc_id: &str,
    payload: Option<&Document>,
) -> EntryHash {
    let preimage = build_canonical_cbor(clock, replica_id, parents, operation, doc_id, payload);
    content_hash(&preimage)
}

/// BLAKE2b-256 of arbitrary bytes; the address used by content-addressed stores
pub fn content_hash(data: &[u8]) -> EntryHash {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Build the canonical CBOR preimage for hashing
/// Format: [schema_version, clock, replica_id, op_tag, doc_id, payload, parents]
///
/// Parents are emitted in ascending byte order and map keys in ascending
/// string order, so the encoding is a pure function of the field values.
pub fn build_canonical_cbor(
    clock: u64,
    replica_id: &ReplicaId,
    parents: &BTreeSet<EntryHash>,
    operation: Operation,
    doc_id: &str,
    payload: Option<&Document>,
) -> Vec<u8> {
    let payload_value = match payload {
        Some(doc) => document_to_cbor(doc),
        None => Cbor::Null,
    };

    let parents_value = Cbor::Array(
        parents.iter().map(|p| Cbor::Bytes(p.to_vec())).collect(),
    );

    let array = Cbor::Array(vec![
        Cbor::Integer(SCHEMA_VERSION.into()),
        Cbor::Integer(clock.into()),
        Cbor::Bytes(replica_id.to_vec()),
        Cbor::Integer(operation.tag().into()),
        Cbor::Text(doc_id.to_string()),
        payload_value,
        parents_value,
    ]);

    let mut buf = Vec::new();
    ciborium::into_writer(&array, &mut buf).expect("CBOR serialization should not fail");
    buf
}

/// Convert a document to a CBOR map with keys in ascending order
pub fn document_to_cbor(doc: &Document) -> Cbor {
    Cbor::Map(
        doc.fields()
            .iter()
            .map(|(k, v)| (Cbor::Text(k.clone()), value_to_cbor(v)))
            .collect(),
    )
}

/// Convert a field value to CBOR
/// This is public so the codec can share the canonical mapping
pub fn value_to_cbor(value: &Value) -> Cbor {
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Integer(i) => Cbor::Integer((*i).into()),
        Value::Float(f) => Cbor::Float(*f),
        Value::String(s) => Cbor::Text(s.clone()),
        Value::List(items) => Cbor::Array(items.iter().map(value_to_cbor).collect()),
        Value::Map(map) => Cbor::Map(
            map.iter()
                .map(|(k, v)| (Cbor::Text(k.clone()), value_to_cbor(v)))
                .collect(),
        ),
    }
}
