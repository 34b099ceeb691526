//! In-crate engine double for unit tests.
//!
//! Integration tests use `room_test_utils::MockEngine`; this smaller double
//! exists because unit tests cannot depend on that crate without seeing a
//! second copy of this crate's types.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{
    ElementHandle, EndpointTag, EngineError, EngineEventSender, IceCandidate, MediaEngine,
    MediaKind, PipelineHandle,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Records edges, candidates and releases; hands out sequential ids.
#[derive(Default)]
pub(crate) struct FakeEngine {
    next_id: AtomicU64,
    pub(crate) edges: Mutex<HashMap<(String, String), BTreeSet<MediaKind>>>,
    pub(crate) candidates: Mutex<Vec<(String, String)>>,
    pub(crate) released: Mutex<Vec<String>>,
    pub(crate) fail_connect: std::sync::atomic::AtomicBool,
    pub(crate) fail_pipeline: std::sync::atomic::AtomicBool,
}

impl FakeEngine {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn legs(kind: Option<MediaKind>) -> Vec<MediaKind> {
        kind.map_or_else(|| vec![MediaKind::Audio, MediaKind::Video], |k| vec![k])
    }

    /// Element ids, following edges carrying both legs from `from`.
    pub(crate) fn path_from(&self, from: &str) -> Vec<String> {
        let edges = self.edges.lock().unwrap();
        let mut path = vec![from.to_string()];
        let mut current = from.to_string();
        while let Some(((_, dst), _)) = edges
            .iter()
            .find(|((src, _), legs)| *src == current && legs.len() == 2)
        {
            if path.contains(dst) {
                break;
            }
            path.push(dst.clone());
            current = dst.clone();
        }
        path
    }

    pub(crate) fn legs_between(&self, src: &str, dst: &str) -> BTreeSet<MediaKind> {
        self.edges
            .lock()
            .unwrap()
            .get(&(src.to_string(), dst.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.edges.lock().unwrap().values().filter(|l| !l.is_empty()).count()
    }
}

#[async_trait::async_trait]
impl MediaEngine for FakeEngine {
    async fn create_pipeline(&self, _events: EngineEventSender) -> Result<PipelineHandle, EngineError> {
        if self.fail_pipeline.load(Ordering::SeqCst) {
            return Err(EngineError::RequestFailed("create_pipeline".to_string()));
        }
        Ok(PipelineHandle::new(self.next("pipeline")))
    }

    async fn create_endpoint(
        &self,
        pipeline: &PipelineHandle,
        _tag: &EndpointTag,
    ) -> Result<ElementHandle, EngineError> {
        Ok(ElementHandle::new(self.next("endpoint"), pipeline.id()))
    }

    async fn create_merge_point(
        &self,
        pipeline: &PipelineHandle,
        _tag: &EndpointTag,
    ) -> Result<ElementHandle, EngineError> {
        Ok(ElementHandle::new(self.next("merge"), pipeline.id()))
    }

    async fn process_offer(&self, _endpoint: &ElementHandle, offer: &str) -> Result<String, EngineError> {
        Ok(format!("answer:{offer}"))
    }

    async fn gather_candidates(&self, _endpoint: &ElementHandle) -> Result<(), EngineError> {
        Ok(())
    }

    async fn add_candidate(
        &self,
        endpoint: &ElementHandle,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError> {
        self.candidates
            .lock()
            .unwrap()
            .push((endpoint.id().to_string(), candidate.candidate.clone()));
        Ok(())
    }

    async fn connect(
        &self,
        source: &ElementHandle,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), EngineError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(EngineError::RequestFailed("connect".to_string()));
        }
        let mut edges = self.edges.lock().unwrap();
        let legs = edges
            .entry((source.id().to_string(), sink.id().to_string()))
            .or_default();
        legs.extend(Self::legs(kind));
        Ok(())
    }

    async fn disconnect(
        &self,
        source: &ElementHandle,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), EngineError> {
        let mut edges = self.edges.lock().unwrap();
        let key = (source.id().to_string(), sink.id().to_string());
        if let Some(legs) = edges.get_mut(&key) {
            for leg in Self::legs(kind) {
                legs.remove(&leg);
            }
            if legs.is_empty() {
                edges.remove(&key);
            }
        }
        Ok(())
    }

    async fn release(&self, element: &ElementHandle) -> Result<(), EngineError> {
        self.edges
            .lock()
            .unwrap()
            .retain(|(src, dst), _| src != element.id() && dst != element.id());
        self.released.lock().unwrap().push(element.id().to_string());
        Ok(())
    }

    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> Result<(), EngineError> {
        self.released.lock().unwrap().push(pipeline.id().to_string());
        Ok(())
    }
}
