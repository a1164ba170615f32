// Pulso Event Backbone - Infrastructure Layer
// Concrete adapters grouped by technology:
// - messaging: NATS JetStream transport, raw event bus/processor, outbox dispatch
// - persistence: Postgres outbox store and message adapters
// - debounce: Redis and in-memory debounce buffers

pub mod debounce;
pub mod messaging;
pub mod persistence;
