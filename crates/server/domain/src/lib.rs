// Pulso Event Backbone - Domain Layer
// Ports and models, free of broker and storage specifics:
// - queue: transport contract, acknowledgement decision, topology
// - resilience: circuit breaker
// - outbox: transactional outbox model and repositories
// - raw_event: raw webhooks, parse errors, typed webhook envelope
// - messaging: ports towards the message, contact and channel aggregates
// - debounce: conversation buffers and the per-push decision

pub mod debounce;
pub mod messaging;
pub mod outbox;
pub mod queue;
pub mod raw_event;
pub mod resilience;
