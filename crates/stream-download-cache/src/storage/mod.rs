//! On-disk storage for cached resources.

mod byte_store;

pub use byte_store::ByteStore;
