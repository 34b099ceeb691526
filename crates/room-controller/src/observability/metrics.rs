//! Metrics definitions for the Room Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `room_` prefix
//! - `_total` suffix for counters
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `tier`: 2 values (privileged, ordinary)
//! - `operation`: bounded by `MediaEngine` methods (~10 values)
//! - `event`: bounded by `RoomNotifier` methods (11 values)
//!
//! Installing an exporter is left to the embedding service; without one the
//! `metrics` facade records to a no-op recorder.

use metrics::{counter, gauge};

// ============================================================================
// Registry Gauges
// ============================================================================

/// Set the number of active rooms.
///
/// Metric: `room_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("room_rooms_active").set(count as f64);
}

/// Adjust the number of joined participants across all rooms.
///
/// Metric: `room_participants_active`
pub fn participant_joined() {
    gauge!("room_participants_active").increment(1.0);
}

/// Metric: `room_participants_active`
pub fn participant_left() {
    gauge!("room_participants_active").decrement(1.0);
}

/// Adjust the number of streaming participants across all rooms.
///
/// Metric: `room_publishers_active`
pub fn publisher_registered() {
    gauge!("room_publishers_active").increment(1.0);
}

/// Metric: `room_publishers_active`
pub fn publisher_deregistered() {
    gauge!("room_publishers_active").decrement(1.0);
}

// ============================================================================
// Engine Counters
// ============================================================================

/// Record a pipeline creation.
///
/// Metric: `room_pipelines_created_total`
pub fn record_pipeline_created() {
    counter!("room_pipelines_created_total").increment(1);
}

/// Record which tier an engine selection was made for.
///
/// Metric: `room_engine_selection_total`
/// Labels: `tier`
pub fn record_engine_selection(tier: &str) {
    counter!("room_engine_selection_total", "tier" => tier.to_string()).increment(1);
}

/// Record a failed engine call.
///
/// Metric: `room_engine_errors_total`
/// Labels: `operation`
pub fn record_engine_error(operation: &str) {
    counter!("room_engine_errors_total", "operation" => operation.to_string()).increment(1);
}

// ============================================================================
// Notification Counters
// ============================================================================

/// Record an upward notification.
///
/// Metric: `room_notifications_total`
/// Labels: `event`
pub fn record_notification(event: &str) {
    counter!("room_notifications_total", "event" => event.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These execute the recording functions against the global no-op
    // recorder; values are not asserted.

    #[test]
    fn test_set_rooms_active() {
        set_rooms_active(0);
        set_rooms_active(1);
        set_rooms_active(1000);
    }

    #[test]
    fn test_participant_and_publisher_gauges() {
        participant_joined();
        participant_left();
        publisher_registered();
        publisher_deregistered();
    }

    #[test]
    fn test_engine_counters() {
        record_pipeline_created();
        record_engine_selection("privileged");
        record_engine_selection("ordinary");
        record_engine_error("create_pipeline");
        record_engine_error("release");
    }

    #[test]
    fn test_record_notification() {
        record_notification("room_created");
        record_notification("participant_evicted");
    }
}
