//! Engine instance pool and room placement.
//!
//! Each [`EngineInstance`] wraps the client of one externally provisioned
//! engine and keeps an element count per pipeline, updated on every creation
//! and release that goes through it. [`EnginePool`] picks the instance that
//! hosts a new room's pipeline.
//!
//! # Selection
//!
//! - Privileged requesters get the least-loaded instance.
//! - Ordinary requesters get the round-robin next instance, or the
//!   least-loaded one if the next is at capacity.
//! - If the chosen instance is still at capacity, selection fails.
//!
//! Tier classification is a pluggable [`TierPolicy`]; the default treats every
//! requester as ordinary.

use super::{
    ElementHandle, EndpointTag, EngineError, EngineEventSender, IceCandidate, MediaEngine,
    MediaKind, PipelineHandle,
};
use crate::config::Config;
use crate::errors::RoomError;
use crate::observability::metrics;

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Requester classification used for engine placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Placed on the least-loaded instance.
    Privileged,
    /// Placed round-robin.
    Ordinary,
}

impl Tier {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tier::Privileged => "privileged",
            Tier::Ordinary => "ordinary",
        }
    }
}

/// Pluggable predicate over the requester's identity.
pub trait TierPolicy: Send + Sync {
    /// Classify the requester.
    fn classify(&self, requester: &str) -> Tier;

    /// Whether the requester may cause a new room to be created.
    fn may_create_room(&self, _requester: &str) -> bool {
        true
    }
}

/// Treats every requester as ordinary.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrivilegeTierPolicy;

impl TierPolicy for NoPrivilegeTierPolicy {
    fn classify(&self, _requester: &str) -> Tier {
        Tier::Ordinary
    }
}

/// Treats an explicit set of requester ids as privileged.
#[derive(Debug, Default, Clone)]
pub struct AllowListTierPolicy {
    privileged: HashSet<String>,
}

impl AllowListTierPolicy {
    #[must_use]
    pub fn new<I, S>(privileged: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            privileged: privileged.into_iter().map(Into::into).collect(),
        }
    }
}

impl TierPolicy for AllowListTierPolicy {
    fn classify(&self, requester: &str) -> Tier {
        if self.privileged.contains(requester) {
            Tier::Privileged
        } else {
            Tier::Ordinary
        }
    }
}

/// One pooled engine with load accounting.
///
/// Implements [`MediaEngine`] by delegating to the wrapped client, so every
/// element created or released through a room is counted here.
pub struct EngineInstance {
    id: String,
    uri: String,
    client: Arc<dyn MediaEngine>,
    max_elements: usize,
    /// Element counts by pipeline id.
    pipelines: DashMap<String, usize>,
    /// Elements this instance created, by id. Stages built elsewhere are
    /// released through here too but never counted.
    counted: DashMap<String, String>,
    element_count: AtomicUsize,
}

impl EngineInstance {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        uri: impl Into<String>,
        client: Arc<dyn MediaEngine>,
        max_elements: usize,
    ) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            client,
            max_elements,
            pipelines: DashMap::new(),
            counted: DashMap::new(),
            element_count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Elements currently alive on this engine.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.element_count.load(Ordering::SeqCst)
    }

    /// Pipelines currently alive on this engine.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether another element fits under the ceiling.
    #[must_use]
    pub fn allow_more(&self) -> bool {
        self.element_count() < self.max_elements
    }

    /// Load in `[0.0, 1.0]`.
    #[must_use]
    pub fn load(&self) -> f64 {
        if self.max_elements == 0 {
            return 1.0;
        }
        // usize to f64 conversion is safe for realistic element counts (< 2^53)
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.element_count() as f64 / self.max_elements as f64;
        ratio.min(1.0)
    }

    fn element_added(&self, element: &ElementHandle) {
        self.counted
            .insert(element.id().to_string(), element.pipeline_id().to_string());
        *self.pipelines.entry(element.pipeline_id().to_string()).or_insert(0) += 1;
        self.element_count.fetch_add(1, Ordering::SeqCst);
    }

    fn element_removed(&self, element: &ElementHandle) {
        let Some((_, pipeline_id)) = self.counted.remove(element.id()) else {
            return;
        };
        if let Some(mut count) = self.pipelines.get_mut(&pipeline_id) {
            if *count > 0 {
                *count -= 1;
                self.element_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl std::fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInstance")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("element_count", &self.element_count())
            .field("max_elements", &self.max_elements)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl MediaEngine for EngineInstance {
    async fn create_pipeline(&self, events: EngineEventSender) -> Result<PipelineHandle, EngineError> {
        let pipeline = self.client.create_pipeline(events).await?;
        self.pipelines.entry(pipeline.id().to_string()).or_insert(0);
        Ok(pipeline)
    }

    async fn create_endpoint(
        &self,
        pipeline: &PipelineHandle,
        tag: &EndpointTag,
    ) -> Result<ElementHandle, EngineError> {
        let endpoint = self.client.create_endpoint(pipeline, tag).await?;
        self.element_added(&endpoint);
        Ok(endpoint)
    }

    async fn create_merge_point(
        &self,
        pipeline: &PipelineHandle,
        tag: &EndpointTag,
    ) -> Result<ElementHandle, EngineError> {
        let merge_point = self.client.create_merge_point(pipeline, tag).await?;
        self.element_added(&merge_point);
        Ok(merge_point)
    }

    async fn process_offer(&self, endpoint: &ElementHandle, offer: &str) -> Result<String, EngineError> {
        self.client.process_offer(endpoint, offer).await
    }

    async fn gather_candidates(&self, endpoint: &ElementHandle) -> Result<(), EngineError> {
        self.client.gather_candidates(endpoint).await
    }

    async fn add_candidate(
        &self,
        endpoint: &ElementHandle,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError> {
        self.client.add_candidate(endpoint, candidate).await
    }

    async fn connect(
        &self,
        source: &ElementHandle,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), EngineError> {
        self.client.connect(source, sink, kind).await
    }

    async fn disconnect(
        &self,
        source: &ElementHandle,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), EngineError> {
        self.client.disconnect(source, sink, kind).await
    }

    async fn release(&self, element: &ElementHandle) -> Result<(), EngineError> {
        self.client.release(element).await?;
        self.element_removed(element);
        Ok(())
    }

    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> Result<(), EngineError> {
        self.client.release_pipeline(pipeline).await?;
        if let Some((_, count)) = self.pipelines.remove(pipeline.id()) {
            self.element_count.fetch_sub(count, Ordering::SeqCst);
        }
        self.counted.retain(|_, owner| owner != pipeline.id());
        Ok(())
    }
}

/// Pool of engine instances with load-aware placement.
pub struct EnginePool {
    instances: Vec<Arc<EngineInstance>>,
    cursor: AtomicUsize,
    policy: Arc<dyn TierPolicy>,
}

impl EnginePool {
    /// Create a pool with the default (no privileged tier) policy.
    #[must_use]
    pub fn new(instances: Vec<Arc<EngineInstance>>) -> Self {
        Self::with_policy(instances, Arc::new(NoPrivilegeTierPolicy))
    }

    #[must_use]
    pub fn with_policy(instances: Vec<Arc<EngineInstance>>, policy: Arc<dyn TierPolicy>) -> Self {
        Self {
            instances,
            cursor: AtomicUsize::new(0),
            policy,
        }
    }

    /// Build a pool from configuration.
    ///
    /// `connect` turns an engine URI into a client; instances are named
    /// `engine-0`, `engine-1`, ... in URI order.
    pub fn from_config<F>(config: &Config, connect: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn MediaEngine>,
    {
        let instances = config
            .engine_uris
            .iter()
            .enumerate()
            .map(|(i, uri)| {
                Arc::new(EngineInstance::new(
                    format!("engine-{i}"),
                    uri.clone(),
                    connect(uri),
                    config.engine_max_elements,
                ))
            })
            .collect();

        let policy: Arc<dyn TierPolicy> = if config.privileged_requesters.is_empty() {
            Arc::new(NoPrivilegeTierPolicy)
        } else {
            Arc::new(AllowListTierPolicy::new(
                config.privileged_requesters.iter().cloned(),
            ))
        };

        Self::with_policy(instances, policy)
    }

    #[must_use]
    pub fn instances(&self) -> &[Arc<EngineInstance>] {
        &self.instances
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Round-robin next instance.
    #[must_use]
    pub fn next(&self) -> Option<Arc<EngineInstance>> {
        if self.instances.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % self.instances.len();
        self.instances.get(idx).cloned()
    }

    /// Least-loaded instance (first one on ties).
    #[must_use]
    pub fn least_loaded(&self) -> Option<Arc<EngineInstance>> {
        self.sorted_by_load().into_iter().next()
    }

    /// Second least-loaded instance, or the only one.
    #[must_use]
    pub fn next_least_loaded(&self) -> Option<Arc<EngineInstance>> {
        let sorted = self.sorted_by_load();
        sorted.get(1).or_else(|| sorted.first()).cloned()
    }

    /// Instances ordered by ascending load (stable).
    #[must_use]
    pub fn sorted_by_load(&self) -> Vec<Arc<EngineInstance>> {
        let mut sorted = self.instances.clone();
        sorted.sort_by(|a, b| a.load().total_cmp(&b.load()));
        sorted
    }

    /// Pick the instance that will host a new room.
    ///
    /// # Errors
    ///
    /// - `RoomError::CreationRefused` - the policy refuses the requester
    /// - `RoomError::NoEngineCapacity` - empty pool or chosen instance full
    #[instrument(skip(self), fields(engines = self.instances.len()))]
    pub fn pick_for_new_room(&self, requester: &str) -> Result<Arc<EngineInstance>, RoomError> {
        if !self.policy.may_create_room(requester) {
            return Err(RoomError::CreationRefused(
                "Requester cannot create a new room".to_string(),
            ));
        }

        let tier = self.policy.classify(requester);
        let (candidate, kind) = match tier {
            Tier::Privileged => (self.least_loaded(), "least loaded"),
            Tier::Ordinary => match self.next() {
                Some(next) if next.allow_more() => (Some(next), "next"),
                _ => (self.least_loaded(), "least loaded"),
            },
        };

        let chosen = candidate
            .ok_or_else(|| RoomError::NoEngineCapacity("No engine instances configured".to_string()))?;

        if !chosen.allow_more() {
            warn!(
                target: "room.engine.pool",
                engine = %chosen.id(),
                elements = chosen.element_count(),
                max_elements = chosen.max_elements(),
                "No resources left to create new room"
            );
            return Err(RoomError::NoEngineCapacity(format!(
                "{} at {} elements",
                chosen.id(),
                chosen.element_count()
            )));
        }

        metrics::record_engine_selection(tier.as_str());
        debug!(
            target: "room.engine.pool",
            tier = tier.as_str(),
            selection = kind,
            engine = %chosen.id(),
            uri = %chosen.uri(),
            load = chosen.load(),
            "Offering engine for new room"
        );

        Ok(chosen)
    }
}
