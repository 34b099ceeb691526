//! Room Controller Library
//!
//! Control plane for multi-party real-time rooms. It tracks which participants
//! belong to which room, wires publish/subscribe relationships between them and
//! places each room's processing work on one of several pooled media engines.
//! Media itself never passes through this crate; every media operation is a
//! request to an external engine behind the [`engine::MediaEngine`] trait.
//!
//! # Architecture
//!
//! ```text
//! RoomManager (registry: room name -> Room, participant id -> room name)
//! ├── EnginePool (one EngineInstance per engine, load-aware placement)
//! └── Room (one per active room, owns one engine pipeline)
//!     ├── engine event pump (candidates and errors -> RoomNotifier)
//!     └── Participant (one per joined client)
//!         ├── PublisherEndpoint -> MediaChain (source -> stages -> merge point)
//!         └── SubscriberLink (one per peer received from)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Lazy pipelines**: a room asks its engine for a pipeline on the first
//!   successful join, exactly once, through a `OnceCell`
//! - **Atomic registries**: every name/id map is a `DashMap` updated through
//!   its entry API, so concurrent creators converge on one value
//! - **Chain lock**: all stage splicing for one publisher is serialized by a
//!   `tokio::sync::Mutex`
//! - **Background release**: engine releases run in spawned tasks; failures
//!   are logged and never retried
//!
//! # Modules
//!
//! - [`manager`] - `RoomManager`, the entry point for every operation
//! - [`room`] - `Room` and its event pump
//! - [`participant`] - `Participant` and `ParticipantInfo`
//! - [`media`] - chain, endpoints and mute algebra
//! - [`engine`] - engine seam and pool
//! - [`notify`] - upward `RoomNotifier` seam
//! - [`config`] - configuration from environment
//! - [`errors`] - error types with room-service codes

pub mod config;
pub mod engine;
pub mod errors;
pub mod manager;
pub mod media;
pub mod notify;
pub mod observability;
pub mod participant;
pub mod room;

pub use errors::{ErrorKind, RoomError};
pub use manager::{JoinOutcome, LeaveOutcome, RoomManager};
pub use notify::{NoopNotifier, RoomNotifier};
pub use participant::ParticipantInfo;
