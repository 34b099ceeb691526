//! Media wiring above the engine.
//!
//! # Components
//!
//! - [`chain`] - `MediaChain`: source, ordered stages, merge point
//! - [`endpoint`] - `EndpointCell`: endpoint slot with candidate buffer
//! - [`publisher`] - `PublisherEndpoint`: exactly-once outbound endpoint
//! - [`subscriber`] - `SubscriberLink`: one inbound link from a peer
//! - [`mute`] - mute state algebra

pub mod chain;
pub mod endpoint;
pub mod mute;
pub mod publisher;
pub mod subscriber;

pub use chain::MediaChain;
pub use endpoint::EndpointCell;
pub use mute::{MuteKind, MuteState};
pub use publisher::{PublisherEndpoint, PublisherPhase};
pub use subscriber::SubscriberLink;
