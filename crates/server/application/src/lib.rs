// Pulso Event Backbone - Application Layer
// Use cases built on the domain ports:
// - webhooks: message handling behind the raw event processor
// - debounce: wait/decision and window/size debouncers, batch publishing

pub mod debounce;
pub mod webhooks;
