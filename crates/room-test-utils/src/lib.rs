//! # Room Test Utilities
//!
//! Shared test utilities for the Room Controller.
//!
//! This crate provides mock implementations and test fixtures for exercising
//! the Room Controller without a real media engine.
//!
//! ## Modules
//!
//! - `mock_engine` - In-memory media engine that records the media graph
//! - `mock_notifier` - Notifier that records every upward notification
//! - `fixtures` - Wired-up manager, participants, offers and candidates
//!
//! ## Usage
//!
//! ```rust,ignore
//! use room_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let env = TestRoomEnv::new();
//!     let alice = TestParticipant::new("alice");
//!
//!     env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
//!     env.manager.publish_media(&alice.id, &alice.offer(), false, vec![]).await.unwrap();
//!
//!     assert_eq!(env.engine().pipelines_created(), 1);
//!     assert_eq!(env.notifier.count_of("stream_published"), 1);
//! }
//! ```
//!
//! ### Race Tests
//!
//! ```rust,ignore
//! let engine = MockEngine::builder()
//!     .pipeline_delay(Duration::from_millis(50))
//!     .build_arc();
//! let env = TestRoomEnv::builder().engine(engine).build();
//! ```

pub mod fixtures;
pub mod mock_engine;
pub mod mock_notifier;

pub use fixtures::*;
pub use mock_engine::*;
pub use mock_notifier::*;

/// Install a test tracing subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
