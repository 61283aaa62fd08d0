//! Counter storage: the atomic check-and-consume primitive and its
//! in-memory and Redis implementations.

mod backend;
mod memory;
mod redis;

pub use backend::{BucketOutcome, CounterStore, StoreError, WindowOutcome};
pub use memory::MemoryStore;
pub use redis::{RedisStore, RedisStoreConfig};
