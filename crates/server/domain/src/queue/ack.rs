//! Acknowledgement decision for a processed delivery

/// Retry ceiling applied to queues declared without an explicit one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Header naming the queue a dead-lettered message was consumed from
pub const DEAD_LETTER_ORIGIN_HEADER: &str = "x-dead-letter-origin";
/// Header carrying the total number of deliveries before dead-lettering
pub const DEAD_LETTER_DELIVERIES_HEADER: &str = "x-dead-letter-deliveries";
/// Header carrying the last consumer failure
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

/// Headers attached to a message routed to its dead-letter queue
pub fn dead_letter_headers(
    queue: &str,
    prior_attempts: u32,
    reason: &str,
) -> [(&'static str, String); 3] {
    [
        (DEAD_LETTER_ORIGIN_HEADER, queue.to_string()),
        (
            DEAD_LETTER_DELIVERIES_HEADER,
            prior_attempts.saturating_add(1).to_string(),
        ),
        (DEAD_LETTER_REASON_HEADER, reason.to_string()),
    ]
}

/// What the transport does with a delivery once the consumer returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processing succeeded
    Ack,
    /// Processing failed below the ceiling: negative-acknowledge with requeue
    Requeue,
    /// Processing failed at or above the ceiling: route to the dead-letter queue
    DeadLetter,
}

impl AckDecision {
    /// Decide from the consumer outcome and the number of prior delivery attempts
    pub fn evaluate<E>(outcome: &Result<(), E>, prior_attempts: u32, max_retries: u32) -> Self {
        match outcome {
            Ok(()) => AckDecision::Ack,
            Err(_) if prior_attempts < max_retries => AckDecision::Requeue,
            Err(_) => AckDecision::DeadLetter,
        }
    }
}
