//! Transactional Outbox Pattern
//!
//! Domain-level abstractions that keep domain state changes and their events
//! consistent: the event is written in the same transaction as the change,
//! then dispatched asynchronously.

pub mod event;
pub mod model;
pub mod repository;

pub use event::DomainEvent;
pub use model::{OutboxError, OutboxEvent, OutboxStatus};
pub use repository::{
    OutboxAppender, OutboxNotificationSource, OutboxNotifications, OutboxRepository, OutboxStats,
};
