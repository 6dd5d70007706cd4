//! Adapters implementing the domain ports.

pub mod cache;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod sync_target;
pub(crate) mod write_set;
