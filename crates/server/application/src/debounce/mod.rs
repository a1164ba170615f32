//! Message debouncing
//!
//! [`MessageDebouncer`] (wait/decision) is the strategy wired by default;
//! [`WindowDebouncer`] (window/size) is the alternate strategy.

pub mod publishing;
pub mod wait_debouncer;
pub mod window_debouncer;

pub use publishing::{DebouncedBatch, PublishingBatchProcessor};
pub use wait_debouncer::{MessageDebouncer, WaitDebouncerConfig};
pub use window_debouncer::{WindowDebouncer, WindowDebouncerConfig};
