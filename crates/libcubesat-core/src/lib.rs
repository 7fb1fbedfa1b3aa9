pub mod types;
pub mod hash;
pub mod codec;
pub mod object_store;
pub mod log;
pub mod merge;
pub mod integrity;
pub mod projection;
pub mod snapshot;
pub mod index;
pub mod replica;
pub mod config;
pub mod error;

pub use error::CubeError;
pub use types::{DocId, EntryHash, ReplicaId};
pub use types::entry::{LogEntry, Operation};
pub use types::value::{Document, Value};
pub use object_store::{ContentAddressedStore, ContentHash, MemoryObjectStore};
pub use log::{JoinStats, LogSnapshot, OperationLog, PendingOp};
pub use merge::Merger;
pub use projection::{DocState, MaterializedView, Projector, Revision};
pub use snapshot::{ContentId, SnapshotManager};
pub use index::{
    AllDocsOptions, AllDocsRow, DocumentIndex, Emitter, FindQuery, MemoryIndex, QueryOptions,
    Reduce, Selector, View, ViewResult, ViewRow, ViewSource,
};
pub use replica::{Replica, WriteResult};
pub use config::{load_replica_config, save_replica_config, FetchConfig, ReplicaConfig};
