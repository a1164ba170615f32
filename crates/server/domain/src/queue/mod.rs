//! Queue Transport abstractions

pub mod ack;
pub mod topology;
pub mod transport;

pub use ack::{
    AckDecision, DEAD_LETTER_DELIVERIES_HEADER, DEAD_LETTER_ORIGIN_HEADER,
    DEAD_LETTER_REASON_HEADER, DEFAULT_MAX_RETRIES, dead_letter_headers,
};
pub use topology::{QueueSpec, raw_event_topology, standard_topology};
pub use transport::{ConsumerError, Delivery, MessageConsumer, QueueTransport, TransportError};
