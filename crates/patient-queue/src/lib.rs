//! Work-item messages and the RabbitMQ adapter which carries them.
//!
//! Queues are durable with at-least-once delivery. The consumer acknowledges a
//! message *before* invoking its callback: a failed callback is logged and
//! dropped rather than redelivered, because the ledger already records the
//! work and the orchestrator's stability loop is the retry mechanism. The only
//! path back onto the queue is rate-limit denial, which nacks with requeue.

mod broker;
mod message;

pub use broker::{Consumer, Producer};
pub use message::{deserialise, serialise, ExportMessage, Message};

/// Queue fed by the orchestrator and drained by the imaging fetcher.
pub const IMAGING_PRIMARY_QUEUE: &str = "imaging-primary";
/// Companion queue for re-routing studies at the secondary archive's rate.
pub const IMAGING_SECONDARY_QUEUE: &str = "imaging-secondary";
/// Queue fed by the anonymiser and drained by the uploader dispatch.
pub const EXPORT_QUEUE: &str = "export";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error")]
    Broker(#[from] lapin::Error),
    #[error("message is not a valid envelope")]
    Envelope(#[from] serde_json::Error),
}
