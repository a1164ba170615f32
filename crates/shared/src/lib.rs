pub mod config;
pub mod queue_names;

pub use queue_names::*;
