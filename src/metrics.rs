//! Metric helpers for `tensor_query`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. Without the
//! `metrics` feature every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the counter tracking frames returned to the consumer.
pub const FRAMES_TOTAL: &str = "tensor_query_frames_total";
/// Name of the counter tracking messages that failed assembly.
pub const ASSEMBLY_ERRORS_TOTAL: &str = "tensor_query_assembly_errors_total";
/// Name of the counter tracking messages destroyed by a queue shutdown.
pub const MESSAGES_DROPPED_TOTAL: &str = "tensor_query_messages_dropped_total";
/// Name of the gauge tracking queued messages.
pub const QUEUE_DEPTH: &str = "tensor_query_queue_depth";

/// Record a frame handed to the consumer.
pub fn inc_frames() {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_TOTAL).increment(1);
}

/// Record a message that could not be assembled.
pub fn inc_assembly_errors() {
    #[cfg(feature = "metrics")]
    counter!(ASSEMBLY_ERRORS_TOTAL).increment(1);
}

/// Record messages destroyed without delivery.
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
pub fn add_dropped(count: usize) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_DROPPED_TOTAL).increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Publish the current queue depth.
#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
#[allow(clippy::cast_precision_loss, reason = "queue depth fits f64 mantissa in practice")]
pub fn set_queue_depth(depth: usize) {
    #[cfg(feature = "metrics")]
    gauge!(QUEUE_DEPTH).set(depth as f64);
}
