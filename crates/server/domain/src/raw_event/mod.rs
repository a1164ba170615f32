//! Raw webhook ingestion model

pub mod model;
pub mod webhook;

pub use model::{
    MARSHAL_FAILURE_MARKER, ParseError, ParseErrorKind, ParsedEvent, RawEvent, RawEventError,
    RawEventFailureEnvelope,
};
pub use webhook::{
    AckCode, AckPayload, MessagePayload, SessionStatusPayload, WebhookEnvelope, WebhookError,
    WebhookEventType,
};
