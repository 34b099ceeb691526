//! Test fixtures: a wired-up manager over mock engines, participants and
//! signaling payloads.

use crate::mock_engine::MockEngine;
use crate::mock_notifier::RecordingNotifier;
use room_controller::engine::{
    AllowListTierPolicy, EngineInstance, EnginePool, IceCandidate, NoPrivilegeTierPolicy, TierPolicy,
};
use room_controller::RoomManager;
use std::sync::Arc;
use std::time::Duration;

/// Element ceiling used when the test does not care about capacity.
pub const TEST_MAX_ELEMENTS: usize = 1_000;

/// A manager over one or more mock engines plus a recording notifier.
pub struct TestRoomEnv {
    pub manager: Arc<RoomManager>,
    pub engines: Vec<Arc<MockEngine>>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestRoomEnv {
    /// One default engine, generous capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> TestRoomEnvBuilder {
        TestRoomEnvBuilder::default()
    }

    /// The first mock engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<MockEngine> {
        self.engines.first().expect("TestRoomEnv has at least one engine")
    }
}

impl Default for TestRoomEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`TestRoomEnv`].
#[derive(Default)]
pub struct TestRoomEnvBuilder {
    engines: Vec<Arc<MockEngine>>,
    max_elements: Option<usize>,
    privileged: Vec<String>,
    release_timeout: Option<Duration>,
}

impl TestRoomEnvBuilder {
    /// Add a pre-configured engine. Without any, one default engine is used.
    #[must_use]
    pub fn engine(mut self, engine: Arc<MockEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    /// Add `n` default engines.
    #[must_use]
    pub fn engines(mut self, n: usize) -> Self {
        self.engines
            .extend((0..n).map(|_| Arc::new(MockEngine::default())));
        self
    }

    /// Element ceiling applied to every engine.
    #[must_use]
    pub fn max_elements(mut self, max: usize) -> Self {
        self.max_elements = Some(max);
        self
    }

    /// Requester treated as privileged.
    #[must_use]
    pub fn privileged(mut self, requester: impl Into<String>) -> Self {
        self.privileged.push(requester.into());
        self
    }

    #[must_use]
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn build(self) -> TestRoomEnv {
        let engines = if self.engines.is_empty() {
            vec![Arc::new(MockEngine::default())]
        } else {
            self.engines
        };
        let max_elements = self.max_elements.unwrap_or(TEST_MAX_ELEMENTS);
        let instances = engines
            .iter()
            .enumerate()
            .map(|(i, engine)| {
                Arc::new(EngineInstance::new(
                    format!("engine-{i}"),
                    format!("ws://engine-{i}.test:8888/kurento"),
                    Arc::clone(engine) as _,
                    max_elements,
                ))
            })
            .collect();
        let policy: Arc<dyn TierPolicy> = if self.privileged.is_empty() {
            Arc::new(NoPrivilegeTierPolicy)
        } else {
            Arc::new(AllowListTierPolicy::new(self.privileged))
        };
        let pool = Arc::new(EnginePool::with_policy(instances, policy));

        let notifier = Arc::new(RecordingNotifier::new());
        let mut manager = RoomManager::new(pool, Arc::clone(&notifier) as _);
        if let Some(timeout) = self.release_timeout {
            manager = manager.with_release_timeout(timeout);
        }

        TestRoomEnv {
            manager: Arc::new(manager),
            engines,
            notifier,
        }
    }
}

/// A participant identity for tests.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    pub id: String,
    pub name: String,
}

impl TestParticipant {
    /// A participant called `name` with a fresh unique id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: participant_id(),
            name: name.into(),
        }
    }

    /// SDP offer attributed to this participant.
    #[must_use]
    pub fn offer(&self) -> String {
        test_offer(&self.name)
    }
}

/// Fresh participant id.
#[must_use]
pub fn participant_id() -> String {
    format!("pid-{}", uuid::Uuid::new_v4())
}

/// Recognisable SDP offer.
#[must_use]
pub fn test_offer(from: &str) -> String {
    format!("v=0\r\no={from} 0 0 IN IP4 127.0.0.1\r\ns=-\r\n")
}

/// The `n`th host candidate.
#[must_use]
pub fn test_candidate(n: u32) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{n} 1 UDP 2122260223 10.0.0.{n} 5000{n} typ host"),
        "0",
        0,
    )
}
