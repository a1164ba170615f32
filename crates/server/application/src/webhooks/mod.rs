//! Webhook use cases

pub mod message_handler;

pub use message_handler::{MessageHandlingOutcome, WebhookMessageHandler};
