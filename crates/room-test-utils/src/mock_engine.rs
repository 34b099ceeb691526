//! Mock media engine.
//!
//! Records every pipeline, element and edge it is asked to create, so tests
//! can assert on the resulting media graph. Can be configured to:
//! - Fail specific operations
//! - Delay pipeline creation (to widen race windows)
//! - Return empty SDP answers
//!
//! # Example
//!
//! ```rust,ignore
//! use room_test_utils::{MockEngine, MockOp};
//!
//! let engine = MockEngine::builder()
//!     .fail(MockOp::ProcessOffer)
//!     .pipeline_delay(Duration::from_millis(50))
//!     .build();
//! ```

use room_controller::engine::{
    ElementHandle, EndpointTag, EngineError, EngineEvent, EngineEventSender, IceCandidate,
    MediaEngine, MediaKind, PipelineHandle,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Engine operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreatePipeline,
    CreateEndpoint,
    CreateMergePoint,
    ProcessOffer,
    GatherCandidates,
    AddCandidate,
    Connect,
    Disconnect,
    Release,
    ReleasePipeline,
}

/// What an element is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Endpoint,
    MergePoint,
    Stage,
}

#[derive(Debug, Clone)]
struct ElementRecord {
    handle: ElementHandle,
    kind: ElementKind,
    tag: EndpointTag,
}

#[derive(Default)]
struct State {
    pipelines: HashMap<String, EngineEventSender>,
    elements: HashMap<String, ElementRecord>,
    edges: HashMap<(String, String), BTreeSet<MediaKind>>,
    candidates: Vec<(String, IceCandidate)>,
    released: Vec<String>,
    failing: HashSet<MockOp>,
}

/// Mock media engine for Room Controller testing.
pub struct MockEngine {
    next_id: AtomicU64,
    pipelines_created: AtomicUsize,
    pipeline_delay: Option<Duration>,
    empty_answers: bool,
    state: Mutex<State>,
}

impl Default for MockEngine {
    fn default() -> Self {
        MockEngine::builder().build()
    }
}

impl MockEngine {
    /// Create a new MockEngine builder.
    #[must_use]
    pub fn builder() -> MockEngineBuilder {
        MockEngineBuilder::default()
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn check(&self, op: MockOp) -> Result<(), EngineError> {
        if self.state.lock().unwrap().failing.contains(&op) {
            tracing::debug!(target: "room.test.mock_engine", op = ?op, "Injected failure");
            return Err(EngineError::RequestFailed(format!("injected failure: {op:?}")));
        }
        Ok(())
    }

    fn legs(kind: Option<MediaKind>) -> Vec<MediaKind> {
        kind.map_or_else(|| vec![MediaKind::Audio, MediaKind::Video], |k| vec![k])
    }

    /// Make `op` fail from now on.
    pub fn fail(&self, op: MockOp) {
        self.state.lock().unwrap().failing.insert(op);
    }

    /// Make `op` succeed again.
    pub fn heal(&self, op: MockOp) {
        self.state.lock().unwrap().failing.remove(&op);
    }

    /// Number of pipelines ever created.
    #[must_use]
    pub fn pipelines_created(&self) -> usize {
        self.pipelines_created.load(Ordering::SeqCst)
    }

    /// Pipelines created and not released.
    #[must_use]
    pub fn live_pipelines(&self) -> usize {
        self.state.lock().unwrap().pipelines.len()
    }

    /// Elements created and not released.
    #[must_use]
    pub fn live_elements(&self) -> usize {
        self.state.lock().unwrap().elements.len()
    }

    /// Ids of everything released, in release order.
    #[must_use]
    pub fn released(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }

    /// Live endpoint owned by `participant_id` under `endpoint_name`.
    ///
    /// The publisher endpoint is named after its owner; a subscriber endpoint
    /// after the peer it receives from.
    #[must_use]
    pub fn endpoint(&self, participant_id: &str, endpoint_name: &str) -> Option<ElementHandle> {
        self.element(participant_id, endpoint_name, ElementKind::Endpoint)
    }

    /// Create a processing stage in `pipeline_id`, as an application would
    /// before handing it to `add_media_element`.
    pub fn create_stage(&self, pipeline_id: &str) -> ElementHandle {
        let handle = ElementHandle::new(self.next("stage"), pipeline_id);
        self.state.lock().unwrap().elements.insert(
            handle.id().to_string(),
            ElementRecord {
                handle: handle.clone(),
                kind: ElementKind::Stage,
                tag: EndpointTag::new("", ""),
            },
        );
        handle
    }

    /// Whether `element` has been created and not released.
    #[must_use]
    pub fn is_live(&self, element: &ElementHandle) -> bool {
        self.state.lock().unwrap().elements.contains_key(element.id())
    }

    /// Live merge point of `participant_id`'s publisher.
    #[must_use]
    pub fn merge_point(&self, participant_id: &str) -> Option<ElementHandle> {
        let state = self.state.lock().unwrap();
        state
            .elements
            .values()
            .find(|e| e.kind == ElementKind::MergePoint && e.tag.participant_id == participant_id)
            .map(|e| e.handle.clone())
    }

    fn element(&self, participant_id: &str, endpoint_name: &str, kind: ElementKind) -> Option<ElementHandle> {
        let state = self.state.lock().unwrap();
        state
            .elements
            .values()
            .find(|e| {
                e.kind == kind
                    && e.tag.participant_id == participant_id
                    && e.tag.endpoint_name == endpoint_name
            })
            .map(|e| e.handle.clone())
    }

    /// Media legs currently flowing `src -> dst`.
    #[must_use]
    pub fn legs_between(&self, src: &ElementHandle, dst: &ElementHandle) -> BTreeSet<MediaKind> {
        self.state
            .lock()
            .unwrap()
            .edges
            .get(&(src.id().to_string(), dst.id().to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether both legs flow `src -> dst`.
    #[must_use]
    pub fn is_connected(&self, src: &ElementHandle, dst: &ElementHandle) -> bool {
        self.legs_between(src, dst).len() == 2
    }

    /// Element ids reached from `from` by following full edges, stopping at
    /// `until` (inclusive) or when no unique next hop exists.
    #[must_use]
    pub fn path(&self, from: &ElementHandle, until: &ElementHandle) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut path = vec![from.id().to_string()];
        let mut current = from.id().to_string();
        while current != until.id() {
            let next: Vec<&String> = state
                .edges
                .iter()
                .filter(|((src, _), legs)| *src == current && legs.len() == 2)
                .map(|((_, dst), _)| dst)
                .collect();
            match next.as_slice() {
                [only] if !path.contains(*only) => {
                    path.push((*only).clone());
                    current = (*only).clone();
                }
                _ => break,
            }
        }
        path
    }

    /// Number of (src, dst) pairs with at least one leg.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.state.lock().unwrap().edges.len()
    }

    /// Remote candidates delivered to `endpoint`, in order.
    #[must_use]
    pub fn candidates_for(&self, endpoint: &ElementHandle) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .candidates
            .iter()
            .filter(|(id, _)| id == endpoint.id())
            .map(|(_, c)| c.candidate.clone())
            .collect()
    }

    /// Push an event into a pipeline's event channel, as the engine would.
    pub async fn emit(&self, pipeline_id: &str, event: EngineEvent) {
        let sender = self.state.lock().unwrap().pipelines.get(pipeline_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Ids of live pipelines.
    #[must_use]
    pub fn pipeline_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().unwrap().pipelines.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait::async_trait]
impl MediaEngine for MockEngine {
    async fn create_pipeline(&self, events: EngineEventSender) -> Result<PipelineHandle, EngineError> {
        if let Some(delay) = self.pipeline_delay {
            tokio::time::sleep(delay).await;
        }
        self.check(MockOp::CreatePipeline)?;
        let id = self.next("pipeline");
        self.state.lock().unwrap().pipelines.insert(id.clone(), events);
        self.pipelines_created.fetch_add(1, Ordering::SeqCst);
        Ok(PipelineHandle::new(id))
    }

    async fn create_endpoint(
        &self,
        pipeline: &PipelineHandle,
        tag: &EndpointTag,
    ) -> Result<ElementHandle, EngineError> {
        self.check(MockOp::CreateEndpoint)?;
        let handle = ElementHandle::new(self.next("endpoint"), pipeline.id());
        self.state.lock().unwrap().elements.insert(
            handle.id().to_string(),
            ElementRecord {
                handle: handle.clone(),
                kind: ElementKind::Endpoint,
                tag: tag.clone(),
            },
        );
        Ok(handle)
    }

    async fn create_merge_point(
        &self,
        pipeline: &PipelineHandle,
        tag: &EndpointTag,
    ) -> Result<ElementHandle, EngineError> {
        self.check(MockOp::CreateMergePoint)?;
        let handle = ElementHandle::new(self.next("merge"), pipeline.id());
        self.state.lock().unwrap().elements.insert(
            handle.id().to_string(),
            ElementRecord {
                handle: handle.clone(),
                kind: ElementKind::MergePoint,
                tag: tag.clone(),
            },
        );
        Ok(handle)
    }

    async fn process_offer(&self, endpoint: &ElementHandle, offer: &str) -> Result<String, EngineError> {
        self.check(MockOp::ProcessOffer)?;
        if self.empty_answers {
            return Ok(String::new());
        }
        Ok(format!("answer[{}]:{offer}", endpoint.id()))
    }

    async fn gather_candidates(&self, _endpoint: &ElementHandle) -> Result<(), EngineError> {
        self.check(MockOp::GatherCandidates)
    }

    async fn add_candidate(
        &self,
        endpoint: &ElementHandle,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError> {
        self.check(MockOp::AddCandidate)?;
        self.state
            .lock()
            .unwrap()
            .candidates
            .push((endpoint.id().to_string(), candidate.clone()));
        Ok(())
    }

    async fn connect(
        &self,
        source: &ElementHandle,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), EngineError> {
        self.check(MockOp::Connect)?;
        let mut state = self.state.lock().unwrap();
        if let Some(gone) = [source, sink]
            .into_iter()
            .find(|e| state.released.iter().any(|id| id == e.id()))
        {
            return Err(EngineError::ElementReleased(gone.id().to_string()));
        }
        state
            .edges
            .entry((source.id().to_string(), sink.id().to_string()))
            .or_default()
            .extend(Self::legs(kind));
        Ok(())
    }

    async fn disconnect(
        &self,
        source: &ElementHandle,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), EngineError> {
        self.check(MockOp::Disconnect)?;
        let mut state = self.state.lock().unwrap();
        let key = (source.id().to_string(), sink.id().to_string());
        if let Some(legs) = state.edges.get_mut(&key) {
            for leg in Self::legs(kind) {
                legs.remove(&leg);
            }
            if legs.is_empty() {
                state.edges.remove(&key);
            }
        }
        Ok(())
    }

    async fn release(&self, element: &ElementHandle) -> Result<(), EngineError> {
        self.check(MockOp::Release)?;
        let mut state = self.state.lock().unwrap();
        state.elements.remove(element.id());
        state
            .edges
            .retain(|(src, dst), _| src != element.id() && dst != element.id());
        state.released.push(element.id().to_string());
        Ok(())
    }

    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> Result<(), EngineError> {
        self.check(MockOp::ReleasePipeline)?;
        let mut state = self.state.lock().unwrap();
        state.pipelines.remove(pipeline.id());
        let doomed: Vec<String> = state
            .elements
            .values()
            .filter(|e| e.handle.pipeline_id() == pipeline.id())
            .map(|e| e.handle.id().to_string())
            .collect();
        for id in &doomed {
            state.elements.remove(id);
        }
        state
            .edges
            .retain(|(src, dst), _| !doomed.contains(src) && !doomed.contains(dst));
        state.released.push(pipeline.id().to_string());
        Ok(())
    }
}

/// Builder for MockEngine configuration.
#[derive(Debug, Default)]
pub struct MockEngineBuilder {
    failing: HashSet<MockOp>,
    pipeline_delay: Option<Duration>,
    empty_answers: bool,
}

impl MockEngineBuilder {
    /// Make `op` fail.
    #[must_use]
    pub fn fail(mut self, op: MockOp) -> Self {
        self.failing.insert(op);
        self
    }

    /// Sleep before creating each pipeline.
    #[must_use]
    pub fn pipeline_delay(mut self, delay: Duration) -> Self {
        self.pipeline_delay = Some(delay);
        self
    }

    /// Answer every offer with an empty SDP.
    #[must_use]
    pub fn empty_answers(mut self) -> Self {
        self.empty_answers = true;
        self
    }

    /// Build the MockEngine.
    #[must_use]
    pub fn build(self) -> MockEngine {
        MockEngine {
            next_id: AtomicU64::new(0),
            pipelines_created: AtomicUsize::new(0),
            pipeline_delay: self.pipeline_delay,
            empty_answers: self.empty_answers,
            state: Mutex::new(State {
                failing: self.failing,
                ..State::default()
            }),
        }
    }

    /// Build the MockEngine behind an `Arc`.
    #[must_use]
    pub fn build_arc(self) -> Arc<MockEngine> {
        Arc::new(self.build())
    }
}
