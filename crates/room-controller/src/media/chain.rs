//! Publisher processing chain.
//!
//! A chain is the path a publisher's media takes inside the engine:
//!
//! ```text
//! source -> stage_1 -> ... -> stage_n -> merge point -> sinks
//! ```
//!
//! Stages are kept in insertion order, oldest nearest the source. Sinks
//! (subscriber endpoints, the loopback) attach to the merge point, so stages
//! can be spliced in and out without touching them.
//!
//! A chain is not internally synchronized; its owner serializes access
//! (see `PublisherEndpoint`).

use super::mute::{MuteKind, MuteState};
use crate::engine::{release_in_background, ElementHandle, MediaEngine, MediaKind};
use crate::errors::RoomError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct MediaChain {
    owner: String,
    source: ElementHandle,
    merge_point: ElementHandle,
    order: Vec<String>,
    stages: HashMap<String, ElementHandle>,
    spliced: bool,
    looped: bool,
    mute: MuteState,
}

impl MediaChain {
    #[must_use]
    pub fn new(owner: impl Into<String>, source: ElementHandle, merge_point: ElementHandle) -> Self {
        Self {
            owner: owner.into(),
            source,
            merge_point,
            order: Vec::new(),
            stages: HashMap::new(),
            spliced: false,
            looped: false,
            mute: MuteState::unmuted(),
        }
    }

    #[must_use]
    pub fn source(&self) -> &ElementHandle {
        &self.source
    }

    #[must_use]
    pub fn merge_point(&self) -> &ElementHandle {
        &self.merge_point
    }

    #[must_use]
    pub fn is_spliced(&self) -> bool {
        self.spliced
    }

    #[must_use]
    pub fn mute_state(&self) -> MuteState {
        self.mute
    }

    /// Stage ids in path order.
    #[must_use]
    pub fn stage_ids(&self) -> &[String] {
        &self.order
    }

    fn stage_at(&self, index: usize) -> Option<&ElementHandle> {
        self.order.get(index).and_then(|id| self.stages.get(id))
    }

    /// Last element before the merge point.
    fn tail(&self) -> &ElementHandle {
        self.order
            .last()
            .and_then(|id| self.stages.get(id))
            .unwrap_or(&self.source)
    }

    /// First element after the source.
    fn head(&self) -> &ElementHandle {
        self.stage_at(0).unwrap_or(&self.merge_point)
    }

    /// Connect `upstream -> downstream`, keeping any published mute on the
    /// first segment.
    async fn link(
        &self,
        engine: &Arc<dyn MediaEngine>,
        upstream: &ElementHandle,
        downstream: &ElementHandle,
    ) -> Result<(), RoomError> {
        engine.connect(upstream, downstream, None).await?;
        if upstream == &self.source {
            if let Some(kind) = self.mute.current() {
                engine.disconnect(upstream, downstream, kind.media_kind()).await?;
            }
        }
        Ok(())
    }

    /// Splice the full path once, then loop the merge point back to the
    /// source if requested.
    pub async fn connect(&mut self, engine: &Arc<dyn MediaEngine>, loopback: bool) -> Result<(), RoomError> {
        if !self.spliced {
            let mut upstream = self.source.clone();
            for id in &self.order {
                if let Some(stage) = self.stages.get(id) {
                    self.link(engine, &upstream, stage).await?;
                    upstream = stage.clone();
                }
            }
            self.link(engine, &upstream, &self.merge_point).await?;
            self.spliced = true;
            debug!(
                target: "room.media.chain",
                owner = %self.owner,
                stages = self.order.len(),
                "Chain spliced"
            );
        }

        if loopback && !self.looped {
            engine.connect(&self.merge_point, &self.source, None).await?;
            self.looped = true;
            trace!(target: "room.media.chain", owner = %self.owner, "Loopback connected");
        }
        Ok(())
    }

    /// Append a stage nearest the merge point.
    ///
    /// # Errors
    ///
    /// `RoomError::DuplicateStage` if the stage id is already present.
    pub async fn insert(&mut self, engine: &Arc<dyn MediaEngine>, stage: ElementHandle) -> Result<(), RoomError> {
        let id = stage.id().to_string();
        if self.stages.contains_key(&id) {
            return Err(RoomError::DuplicateStage(id));
        }

        if self.spliced {
            let tail = self.tail().clone();
            engine.disconnect(&tail, &self.merge_point, None).await?;
            self.link(engine, &tail, &stage).await?;
            engine.connect(&stage, &self.merge_point, None).await?;
        }

        self.order.push(id.clone());
        self.stages.insert(id.clone(), stage);
        debug!(
            target: "room.media.chain",
            owner = %self.owner,
            stage = %id,
            spliced = self.spliced,
            "Stage inserted"
        );
        Ok(())
    }

    /// Remove a stage, joining its neighbours, and release it.
    ///
    /// # Errors
    ///
    /// `RoomError::StageNotFound` if the stage id is absent.
    pub async fn remove(&mut self, engine: &Arc<dyn MediaEngine>, stage_id: &str) -> Result<(), RoomError> {
        let stage = self.detach(engine, stage_id).await?;
        release_in_background(Arc::clone(engine), stage, self.owner.clone());
        Ok(())
    }

    /// Take a stage out of the path, joining its neighbours. The stage is
    /// handed back unreleased.
    pub async fn detach(&mut self, engine: &Arc<dyn MediaEngine>, stage_id: &str) -> Result<ElementHandle, RoomError> {
        let index = self
            .order
            .iter()
            .position(|id| id == stage_id)
            .ok_or_else(|| RoomError::StageNotFound(stage_id.to_string()))?;

        if self.spliced {
            let upstream = index
                .checked_sub(1)
                .and_then(|i| self.stage_at(i))
                .unwrap_or(&self.source)
                .clone();
            let downstream = self
                .stage_at(index + 1)
                .unwrap_or(&self.merge_point)
                .clone();
            let stage = self
                .stages
                .get(stage_id)
                .cloned()
                .ok_or_else(|| RoomError::StageNotFound(stage_id.to_string()))?;

            engine.disconnect(&upstream, &stage, None).await?;
            engine.disconnect(&stage, &downstream, None).await?;
            self.link(engine, &upstream, &downstream).await?;
        }

        self.order.remove(index);
        let stage = self
            .stages
            .remove(stage_id)
            .ok_or_else(|| RoomError::StageNotFound(stage_id.to_string()))?;
        debug!(
            target: "room.media.chain",
            owner = %self.owner,
            stage = %stage_id,
            "Stage detached"
        );
        Ok(stage)
    }

    /// Attach a consumer to the merge point.
    pub async fn connect_sink(
        &self,
        engine: &Arc<dyn MediaEngine>,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), RoomError> {
        engine.connect(&self.merge_point, sink, kind).await?;
        Ok(())
    }

    /// Detach a consumer from the merge point.
    pub async fn disconnect_sink(
        &self,
        engine: &Arc<dyn MediaEngine>,
        sink: &ElementHandle,
        kind: Option<MediaKind>,
    ) -> Result<(), RoomError> {
        engine.disconnect(&self.merge_point, sink, kind).await?;
        Ok(())
    }

    /// Stop the given leg(s) at the first segment after the source.
    ///
    /// # Errors
    ///
    /// `RoomError::Mute` when the chain has not been spliced yet.
    pub async fn mute(&mut self, engine: &Arc<dyn MediaEngine>, kind: MuteKind) -> Result<(), RoomError> {
        if !self.spliced {
            return Err(RoomError::Mute(format!(
                "'{}' is not publishing media",
                self.owner
            )));
        }
        if self.mute.covers(kind) {
            trace!(target: "room.media.chain", owner = %self.owner, kind = kind.as_str(), "Already muted");
            return Ok(());
        }
        let head = self.head().clone();
        engine.disconnect(&self.source, &head, kind.media_kind()).await?;
        self.mute = self.mute.fold(kind);
        Ok(())
    }

    /// Reconnect the first segment fully.
    pub async fn unmute(&mut self, engine: &Arc<dyn MediaEngine>) -> Result<(), RoomError> {
        if !self.spliced {
            return Err(RoomError::Mute(format!(
                "'{}' is not publishing media",
                self.owner
            )));
        }
        if !self.mute.is_muted() {
            return Ok(());
        }
        let head = self.head().clone();
        engine.connect(&self.source, &head, None).await?;
        self.mute = self.mute.cleared();
        Ok(())
    }

    /// Release the stages and the merge point. The source belongs to the
    /// publisher and is released there.
    pub fn release(self, engine: &Arc<dyn MediaEngine>) {
        for id in &self.order {
            if let Some(stage) = self.stages.get(id) {
                release_in_background(Arc::clone(engine), stage.clone(), self.owner.clone());
            }
        }
        release_in_background(Arc::clone(engine), self.merge_point, self.owner);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;
    use crate::errors::ErrorKind;
    use std::collections::BTreeSet;

    struct Fixture {
        fake: Arc<FakeEngine>,
        engine: Arc<dyn MediaEngine>,
        chain: MediaChain,
    }

    fn fixture() -> Fixture {
        let fake = Arc::new(FakeEngine::default());
        let engine: Arc<dyn MediaEngine> = fake.clone();
        let chain = MediaChain::new(
            "alice",
            ElementHandle::new("src", "pl"),
            ElementHandle::new("merge", "pl"),
        );
        Fixture { fake, engine, chain }
    }

    fn stage(id: &str) -> ElementHandle {
        ElementHandle::new(id, "pl")
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut f = fixture();
        f.chain.connect(&f.engine, false).await.unwrap();
        f.chain.connect(&f.engine, false).await.unwrap();
        assert_eq!(f.fake.edge_count(), 1);
        assert_eq!(f.fake.path_from("src"), vec!["src", "merge"]);
    }

    #[tokio::test]
    async fn test_loopback_connects_merge_to_source_once() {
        let mut f = fixture();
        f.chain.connect(&f.engine, true).await.unwrap();
        f.chain.connect(&f.engine, true).await.unwrap();
        assert_eq!(f.fake.edge_count(), 2);
        assert_eq!(f.fake.legs_between("merge", "src").len(), 2);
    }

    #[tokio::test]
    async fn test_stages_recorded_before_splice_are_wired_in_order() {
        let mut f = fixture();
        f.chain.insert(&f.engine, stage("a")).await.unwrap();
        f.chain.insert(&f.engine, stage("b")).await.unwrap();
        assert_eq!(f.fake.edge_count(), 0);

        f.chain.connect(&f.engine, false).await.unwrap();
        assert_eq!(f.fake.path_from("src"), vec!["src", "a", "b", "merge"]);
    }

    #[tokio::test]
    async fn test_insert_while_spliced_appends_before_merge() {
        let mut f = fixture();
        f.chain.connect(&f.engine, false).await.unwrap();
        f.chain.insert(&f.engine, stage("a")).await.unwrap();
        f.chain.insert(&f.engine, stage("b")).await.unwrap();

        assert_eq!(f.fake.path_from("src"), vec!["src", "a", "b", "merge"]);
        assert!(f.fake.legs_between("src", "merge").is_empty());
        assert_eq!(f.fake.edge_count(), 3);
    }

    #[tokio::test]
    async fn test_remove_middle_stage_joins_neighbours() {
        let mut f = fixture();
        f.chain.connect(&f.engine, false).await.unwrap();
        for id in ["a", "b", "c"] {
            f.chain.insert(&f.engine, stage(id)).await.unwrap();
        }
        f.chain.remove(&f.engine, "b").await.unwrap();

        assert_eq!(f.fake.path_from("src"), vec!["src", "a", "c", "merge"]);
        assert_eq!(f.chain.stage_ids(), ["a", "c"]);
    }

    #[tokio::test]
    async fn test_remove_only_stage_reconnects_source_to_merge() {
        let mut f = fixture();
        f.chain.connect(&f.engine, false).await.unwrap();
        f.chain.insert(&f.engine, stage("a")).await.unwrap();
        f.chain.remove(&f.engine, "a").await.unwrap();

        assert_eq!(f.fake.path_from("src"), vec!["src", "merge"]);
        assert_eq!(f.fake.edge_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_unspliced_stage_keeps_it_alive() {
        let mut f = fixture();
        f.chain.insert(&f.engine, stage("a")).await.unwrap();

        let detached = f.chain.detach(&f.engine, "a").await.unwrap();
        assert_eq!(detached, stage("a"));
        assert!(f.chain.stage_ids().is_empty());
        assert_eq!(f.fake.edge_count(), 0);

        tokio::task::yield_now().await;
        assert!(f.fake.released.lock().unwrap().is_empty());

        // Same handle can go straight back in.
        f.chain.insert(&f.engine, detached).await.unwrap();
        assert_eq!(f.chain.stage_ids(), ["a"]);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_stage_errors() {
        let mut f = fixture();
        f.chain.insert(&f.engine, stage("a")).await.unwrap();

        let dup = f.chain.insert(&f.engine, stage("a")).await.unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::Conflict);

        let missing = f.chain.remove(&f.engine, "zzz").await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(f.chain.stage_ids(), ["a"]);
    }

    #[tokio::test]
    async fn test_mute_disconnects_only_requested_leg() {
        let mut f = fixture();
        f.chain.connect(&f.engine, false).await.unwrap();

        f.chain.mute(&f.engine, MuteKind::Audio).await.unwrap();
        assert_eq!(
            f.fake.legs_between("src", "merge"),
            BTreeSet::from([MediaKind::Video])
        );

        // Muting the same leg again changes nothing.
        f.chain.mute(&f.engine, MuteKind::Audio).await.unwrap();
        assert_eq!(f.chain.mute_state().current(), Some(MuteKind::Audio));

        f.chain.mute(&f.engine, MuteKind::Video).await.unwrap();
        assert_eq!(f.chain.mute_state().current(), Some(MuteKind::All));
        assert!(f.fake.legs_between("src", "merge").is_empty());

        f.chain.unmute(&f.engine).await.unwrap();
        assert_eq!(f.fake.legs_between("src", "merge").len(), 2);
        assert!(!f.chain.mute_state().is_muted());
    }

    #[tokio::test]
    async fn test_mute_survives_insert_at_head() {
        let mut f = fixture();
        f.chain.connect(&f.engine, false).await.unwrap();
        f.chain.mute(&f.engine, MuteKind::Video).await.unwrap();
        f.chain.insert(&f.engine, stage("a")).await.unwrap();

        assert_eq!(
            f.fake.legs_between("src", "a"),
            BTreeSet::from([MediaKind::Audio])
        );
        assert_eq!(f.fake.legs_between("a", "merge").len(), 2);
    }

    #[tokio::test]
    async fn test_mute_before_splice_is_rejected() {
        let mut f = fixture();
        let err = f.chain.mute(&f.engine, MuteKind::Audio).await.unwrap_err();
        assert!(matches!(err, RoomError::Mute(_)));
    }

    #[tokio::test]
    async fn test_sinks_attach_to_merge_point() {
        let mut f = fixture();
        f.chain.connect(&f.engine, false).await.unwrap();
        let sink = ElementHandle::new("sub-1", "pl");

        f.chain.connect_sink(&f.engine, &sink, None).await.unwrap();
        f.chain.insert(&f.engine, stage("a")).await.unwrap();
        assert_eq!(f.fake.legs_between("merge", "sub-1").len(), 2);

        f.chain
            .disconnect_sink(&f.engine, &sink, Some(MediaKind::Audio))
            .await
            .unwrap();
        assert_eq!(
            f.fake.legs_between("merge", "sub-1"),
            BTreeSet::from([MediaKind::Video])
        );
    }
}
