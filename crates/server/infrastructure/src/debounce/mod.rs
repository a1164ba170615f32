//! Debounce buffer stores

pub mod in_memory;
pub mod redis_store;

pub use in_memory::InMemoryDebounceStore;
pub use redis_store::RedisDebounceStore;
