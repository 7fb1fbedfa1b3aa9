use rand::Rng;
use thiserror::Error;

/// 128-bit replica identifier (random, stable for the replica's lifetime)
pub type ReplicaId = [u8; 16];

/// 256-bit content hash (BLAKE2b-256)
pub type EntryHash = [u8; 32];

/// Document identifier
pub type DocId = String;

#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid content id prefix: {0}")]
    InvalidPrefix(String),
}

/// Generate a random 128-bit replica ID
pub fn generate_replica_id() -> ReplicaId {
    rand::thread_rng().gen()
}

/// Generate a fresh document ID for documents posted without one
pub fn generate_doc_id() -> DocId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Convert a fixed-size byte array to lowercase hex string
pub fn id_to_hex<const N: usize>(id: &[u8; N]) -> String {
    hex::encode(id)
}

/// Parse a hex string into a fixed-size byte array
pub fn hex_to_id<const N: usize>(hex_str: &str) -> Result<[u8; N], IdParseError> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != N {
        return Err(IdParseError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Parse a replica ID from hex string
pub fn parse_replica_id(hex_str: &str) -> Result<ReplicaId, IdParseError> {
    hex_to_id::<16>(hex_str)
}

/// Parse an entry hash from hex string
pub fn parse_entry_hash(hex_str: &str) -> Result<EntryHash, IdParseError> {
    hex_to_id::<32>(hex_str)
}

/// Short form of a hash for log lines and error messages
pub fn short_hash(hash: &EntryHash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_replica_id_is_random() {
        let id1 = generate_replica_id();
        let id2 = generate_replica_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_generate_doc_id_is_unique() {
        let a = generate_doc_id();
        let b = generate_doc_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_id_to_hex() {
        let id: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
        assert_eq!(id_to_hex(&id), "000102030405060708090a0b0c0d0e0f");
    }

    #[test]
    fn test_hex_to_id_invalid_length() {
        let result: Result<[u8; 16], _> = hex_to_id("0001020304");
        assert!(matches!(result, Err(IdParseError::InvalidLength { .. })));
    }

    #[test]
    fn test_hex_to_id_invalid_hex() {
        let result: Result<[u8; 16], _> = hex_to_id("not_valid_hex!");
        assert!(matches!(result, Err(IdParseError::InvalidHex(_))));
    }

    #[test]
    fn test_short_hash() {
        let hash = [0xabu8; 32];
        assert_eq!(short_hash(&hash), "abababababababab");
    }
}
