//! Observability module for the Room Controller.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `room_rooms_active` | Gauge | none | Rooms in the registry |
//! | `room_participants_active` | Gauge | none | Joined participants |
//! | `room_publishers_active` | Gauge | none | Streaming participants |
//! | `room_pipelines_created_total` | Counter | none | Pipelines requested from engines |
//! | `room_engine_selection_total` | Counter | `tier` | Engine picks per requester tier |
//! | `room_engine_errors_total` | Counter | `operation` | Failed engine calls |
//! | `room_notifications_total` | Counter | `event` | Upward notifications |
//!
//! Logging uses `tracing` with `room.*` targets and never records SDP bodies
//! above `trace` level.

pub mod metrics;
