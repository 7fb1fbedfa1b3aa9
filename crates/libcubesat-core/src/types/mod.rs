pub mod ids;
pub mod value;
pub mod entry;

pub use ids::{DocId, EntryHash, ReplicaId};
pub use ids::{generate_doc_id, generate_replica_id, hex_to_id, id_to_hex, short_hash};
pub use value::{Document, Value, ID_KEY, REV_KEY};
pub use entry::{LogEntry, Operation};
