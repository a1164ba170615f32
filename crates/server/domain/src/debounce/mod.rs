//! Message debouncing: coalescing rapid message fragments per conversation

pub mod model;
pub mod store;

pub use model::{
    BufferedMessage, Clock, DebounceDecision, SessionKey, SystemClock, sort_by_timestamp,
};
pub use store::{BatchProcessor, DebounceError, DebounceStore};
