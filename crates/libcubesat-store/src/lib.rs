//! Persistent storage for cubesat replicas
//!
//! Provides a sled-backed [`ContentAddressedStore`](libcubesat_core::ContentAddressedStore),
//! a sled-backed [`DocumentIndex`](libcubesat_core::DocumentIndex), and
//! [`LockedReplica`] for opening a replica directory exclusively.

pub mod error;
pub mod objects;
pub mod index;
pub mod replica_dir;

pub use error::StoreError;
pub use objects::SledObjectStore;
pub use index::SledIndex;
pub use replica_dir::LockedReplica;
