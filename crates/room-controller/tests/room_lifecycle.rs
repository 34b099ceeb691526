//! Room lifecycle tests through the `RoomManager` surface.
//!
//! Covers:
//! - Join, publish, subscribe and leave across two participants
//! - Name conflicts and rollback of failed joins
//! - Exactly-once pipeline creation under concurrent first joins
//! - Administrative close, eviction and shutdown

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use room_controller::errors::{ErrorKind, RoomError};
use room_controller::participant::DEFAULT_STREAM_ID;
use room_test_utils::{init_test_tracing, MockEngine, MockOp, NotifierEvent, TestParticipant, TestRoomEnv};

/// Let background releases run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// ============================================================================
// Join / leave
// ============================================================================

#[tokio::test]
async fn test_two_participants_publish_subscribe_and_leave() {
    init_test_tracing();
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let bob = TestParticipant::new("bob");

    let joined = env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    assert!(joined.created_room);
    assert!(joined.existing.is_empty());
    assert_eq!(env.engine().pipelines_created(), 1);

    let joined = env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();
    assert!(!joined.created_room);
    assert_eq!(joined.existing.len(), 1);
    assert_eq!(joined.existing.first().unwrap().name, "alice");
    assert_eq!(env.engine().pipelines_created(), 1);

    let answer = env
        .manager
        .publish_media(&alice.id, &alice.offer(), false, vec![])
        .await
        .unwrap();
    assert!(!answer.is_empty());

    let published = env.notifier.events_named("stream_published");
    assert_eq!(
        published,
        vec![NotifierEvent::StreamPublished {
            room: "lobby".to_string(),
            publisher: "alice".to_string(),
            recipients: vec![bob.id.clone()],
        }]
    );

    let answer = env.manager.subscribe(&bob.id, "alice", &bob.offer()).await.unwrap();
    assert!(!answer.is_empty());

    let merge = env.engine().merge_point(&alice.id).unwrap();
    let bob_endpoint = env.engine().endpoint(&bob.id, "alice").unwrap();
    assert!(env.engine().is_connected(&merge, &bob_endpoint));

    let publishers = env.manager.publishers("lobby").unwrap();
    assert_eq!(publishers.len(), 1);
    assert_eq!(publishers.first().unwrap().streams().first().unwrap().id, DEFAULT_STREAM_ID);
    let subscribers = env.manager.subscribers("lobby").await.unwrap();
    assert_eq!(subscribers.first().unwrap().name, "bob");
    let peer_subscribers = env.manager.peer_subscribers(&alice.id).await.unwrap();
    assert_eq!(peer_subscribers.len(), 1);
    let peer_publishers = env.manager.peer_publishers(&bob.id).unwrap();
    assert_eq!(peer_publishers.first().unwrap().name, "alice");

    let left = env.manager.leave_room(&bob.id).await.unwrap();
    assert_eq!(left.remaining, vec![alice.id.clone()]);
    assert!(!left.room_closed);

    let left = env.manager.leave_room(&alice.id).await.unwrap();
    assert!(left.room_closed);
    assert!(env.manager.rooms().is_empty());

    settle().await;
    assert_eq!(env.engine().live_pipelines(), 0);
    assert_eq!(env.engine().live_elements(), 0);
}

#[tokio::test]
async fn test_departing_publisher_takes_inbound_links_with_it() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let bob = TestParticipant::new("bob");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();
    env.manager
        .publish_media(&alice.id, &alice.offer(), false, vec![])
        .await
        .unwrap();
    env.manager.subscribe(&bob.id, "alice", &bob.offer()).await.unwrap();
    let bob_endpoint = env.engine().endpoint(&bob.id, "alice").unwrap();

    let left = env.manager.leave_room(&alice.id).await.unwrap();
    assert_eq!(left.remaining, vec![bob.id.clone()]);
    assert!(!left.room_closed);

    let bob_in_room = env.manager.room("lobby").unwrap().participant(&bob.id).unwrap();
    assert!(bob_in_room.receiving_from().await.is_empty());
    let names: Vec<String> = env
        .manager
        .participants("lobby")
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["bob".to_string()]);
    assert!(env.manager.peer_publishers(&bob.id).unwrap().is_empty());
    assert_eq!(env.manager.room("lobby").unwrap().active_publishers(), 0);

    settle().await;
    assert!(!env.engine().is_live(&bob_endpoint));
    assert!(env.engine().released().contains(&bob_endpoint.id().to_string()));
}

#[tokio::test]
async fn test_duplicate_name_is_rejected_without_side_effects() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let impostor = TestParticipant::new("alice");

    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    let err = env
        .manager
        .join_room(&impostor.id, &impostor.name, "lobby")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.error_code(), 104);
    assert_eq!(env.manager.participants("lobby").unwrap().len(), 1);
    assert_eq!(env.notifier.count_of("participant_joined"), 1);

    // The failed id was not left registered.
    env.manager.join_room(&impostor.id, "carol", "lobby").await.unwrap();
    assert_eq!(env.manager.participants("lobby").unwrap().len(), 2);
}

#[tokio::test]
async fn test_same_id_cannot_join_twice() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");

    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    let err = env.manager.join_room(&alice.id, "alice2", "other").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(env.manager.rooms(), vec!["lobby".to_string()]);
}

#[tokio::test]
async fn test_empty_name_is_invalid() {
    let env = TestRoomEnv::new();
    let err = env.manager.join_room("p1", "", "lobby").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(env.manager.rooms().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_joins_create_one_pipeline() {
    let engine = MockEngine::builder()
        .pipeline_delay(Duration::from_millis(50))
        .build_arc();
    let env = TestRoomEnv::builder().engine(Arc::clone(&engine)).build();

    let mut handles = Vec::new();
    for n in 0..8 {
        let manager = Arc::clone(&env.manager);
        let participant = TestParticipant::new(format!("user-{n}"));
        handles.push(tokio::spawn(async move {
            manager
                .join_room(&participant.id, &participant.name, "race")
                .await
        }));
    }

    let mut created = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.created_room {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(engine.pipelines_created(), 1);
    assert_eq!(env.notifier.count_of("room_created"), 1);
    assert_eq!(env.manager.participants("race").unwrap().len(), 8);
}

#[tokio::test]
async fn test_join_after_last_leave_gets_a_fresh_room() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    let old_room = env.manager.room("lobby").unwrap();

    // The last member is out, so the room is closing but not yet removed.
    assert!(old_room.leave(&alice.id).await.unwrap());
    assert!(old_room.is_closing());
    assert_eq!(env.manager.rooms(), vec!["lobby".to_string()]);

    let bob = TestParticipant::new("bob");
    let joined = env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();
    assert!(joined.created_room);

    let new_room = env.manager.room("lobby").unwrap();
    assert!(!Arc::ptr_eq(&old_room, &new_room));
    assert!(new_room.participant(&bob.id).is_some());
    assert!(old_room.participant(&bob.id).is_none());
    assert_eq!(env.engine().pipelines_created(), 2);

    env.manager.leave_room(&bob.id).await.unwrap();
    assert!(env.manager.rooms().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_racing_last_leave_always_lands_in_a_live_room() {
    let env = TestRoomEnv::new();

    for round in 0..50 {
        let alice = TestParticipant::new(format!("alice-{round}"));
        let bob = TestParticipant::new(format!("bob-{round}"));
        env.manager.join_room(&alice.id, &alice.name, "churn").await.unwrap();

        let leaver = Arc::clone(&env.manager);
        let alice_id = alice.id.clone();
        let leave = tokio::spawn(async move { leaver.leave_room(&alice_id).await });
        let joiner = Arc::clone(&env.manager);
        let (bob_id, bob_name) = (bob.id.clone(), bob.name.clone());
        let join = tokio::spawn(async move { joiner.join_room(&bob_id, &bob_name, "churn").await });

        leave.await.unwrap().unwrap();
        join.await.unwrap().unwrap();

        let room = env.manager.room("churn").unwrap();
        assert!(!room.is_closing());
        assert!(room.participant(&bob.id).is_some());
        env.manager.leave_room(&bob.id).await.unwrap();
    }
    assert!(env.manager.rooms().is_empty());
}

#[tokio::test]
async fn test_failed_first_join_rolls_back_room() {
    let engine = MockEngine::builder().fail(MockOp::CreatePipeline).build_arc();
    let env = TestRoomEnv::builder().engine(Arc::clone(&engine)).build();
    let alice = TestParticipant::new("alice");

    let err = env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert!(env.manager.rooms().is_empty());

    engine.heal(MockOp::CreatePipeline);
    let joined = env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    assert!(joined.created_room);
}

#[tokio::test]
async fn test_leave_unknown_participant() {
    let env = TestRoomEnv::new();
    let err = env.manager.leave_room("nobody").await.unwrap_err();

    assert!(matches!(err, RoomError::ParticipantNotFound(_)));
    assert_eq!(err.error_code(), 102);
}

#[tokio::test]
async fn test_create_room_is_idempotent() {
    let env = TestRoomEnv::new();

    assert!(env.manager.create_room("lobby").await.unwrap());
    assert!(!env.manager.create_room("lobby").await.unwrap());
    assert_eq!(env.manager.rooms(), vec!["lobby".to_string()]);

    // No pipeline until somebody joins.
    assert_eq!(env.engine().pipelines_created(), 0);
    assert!(!env.manager.room_info("lobby").unwrap().has_pipeline);
}

// ============================================================================
// Publish / subscribe edge cases
// ============================================================================

#[tokio::test]
async fn test_unpublish_tears_down_links_and_allows_republish() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let bob = TestParticipant::new("bob");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();
    env.manager
        .publish_media(&alice.id, &alice.offer(), false, vec![])
        .await
        .unwrap();
    env.manager.subscribe(&bob.id, "alice", &bob.offer()).await.unwrap();

    env.manager.unpublish_media(&alice.id).await.unwrap();

    assert!(env.manager.publishers("lobby").unwrap().is_empty());
    assert!(env.manager.subscribers("lobby").await.unwrap().is_empty());
    assert_eq!(env.notifier.count_of("stream_unpublished"), 1);
    assert_eq!(env.manager.room("lobby").unwrap().active_publishers(), 0);

    let err = env.manager.unpublish_media(&alice.id).await.unwrap_err();
    assert!(matches!(err, RoomError::NotStreaming(_)));

    env.manager
        .publish_media(&alice.id, &alice.offer(), false, vec![])
        .await
        .unwrap();
    assert_eq!(env.manager.publishers("lobby").unwrap().len(), 1);
}

#[tokio::test]
async fn test_subscribe_to_non_publisher_has_no_answer() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let bob = TestParticipant::new("bob");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();

    let err = env.manager.subscribe(&bob.id, "alice", &bob.offer()).await.unwrap_err();
    assert!(matches!(err, RoomError::NoAnswer(_)));
    assert_eq!(err.error_code(), 101);
}

#[tokio::test]
async fn test_subscribe_rejects_self_and_unknown_peer() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();

    let err = env.manager.subscribe(&alice.id, "alice", &alice.offer()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = env.manager.subscribe(&alice.id, "ghost", &alice.offer()).await.unwrap_err();
    assert!(matches!(err, RoomError::PeerNotFound { .. }));
}

#[tokio::test]
async fn test_empty_answer_fails_publish() {
    let engine = MockEngine::builder().empty_answers().build_arc();
    let env = TestRoomEnv::builder().engine(engine).build();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();

    let err = env
        .manager
        .publish_media(&alice.id, &alice.offer(), false, vec![])
        .await
        .unwrap_err();

    assert!(matches!(err, RoomError::NoAnswer(_)));
    assert_eq!(env.notifier.count_of("stream_published"), 0);
    assert!(env.manager.publishers("lobby").unwrap().is_empty());
}

// ============================================================================
// Messaging
// ============================================================================

#[tokio::test]
async fn test_message_reaches_whole_room() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let bob = TestParticipant::new("bob");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();

    env.manager
        .send_message(&alice.id, "alice", "lobby", "hello")
        .await
        .unwrap();

    let mut expected = vec![alice.id.clone(), bob.id.clone()];
    expected.sort();
    assert_eq!(
        env.notifier.events_named("message_broadcast"),
        vec![NotifierEvent::MessageBroadcast {
            room: "lobby".to_string(),
            sender: "alice".to_string(),
            message: "hello".to_string(),
            recipients: expected,
        }]
    );
}

#[tokio::test]
async fn test_message_with_mismatched_identity_is_rejected() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();

    let err = env
        .manager
        .send_message(&alice.id, "mallory", "lobby", "hi")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = env
        .manager
        .send_message(&alice.id, "alice", "elsewhere", "hi")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(env.notifier.count_of("message_broadcast"), 0);
}

// ============================================================================
// Administration
// ============================================================================

#[tokio::test]
async fn test_close_room_evicts_everyone() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let bob = TestParticipant::new("bob");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();
    env.manager
        .publish_media(&alice.id, &alice.offer(), false, vec![])
        .await
        .unwrap();

    let mut evicted = env.manager.close_room("lobby").await.unwrap();
    evicted.sort();
    let mut expected = vec![alice.id.clone(), bob.id.clone()];
    expected.sort();
    assert_eq!(evicted, expected);

    assert!(env.manager.rooms().is_empty());
    assert_eq!(env.notifier.count_of("room_closed"), 1);
    assert_eq!(env.notifier.count_of("participant_evicted"), 2);

    let err = env.manager.leave_room(&alice.id).await.unwrap_err();
    assert!(matches!(err, RoomError::ParticipantNotFound(_)));
    let err = env.manager.close_room("lobby").await.unwrap_err();
    assert!(matches!(err, RoomError::RoomNotFound(_)));

    settle().await;
    assert_eq!(env.engine().live_pipelines(), 0);
}

#[tokio::test]
async fn test_close_room_after_closure_claimed_is_a_state_error() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    let room = env.manager.room("lobby").unwrap();
    assert!(room.leave(&alice.id).await.unwrap());

    let err = env.manager.close_room("lobby").await.unwrap_err();
    assert!(matches!(err, RoomError::RoomClosed(_)));
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(env.notifier.count_of("room_closed"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_close_room_closes_once() {
    let env = TestRoomEnv::new();
    for n in 0..6 {
        let participant = TestParticipant::new(format!("user-{n}"));
        env.manager
            .join_room(&participant.id, &participant.name, "lobby")
            .await
            .unwrap();
    }

    let first = Arc::clone(&env.manager);
    let second = Arc::clone(&env.manager);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.close_room("lobby").await }),
        tokio::spawn(async move { second.close_room("lobby").await }),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    for outcome in &outcomes {
        if let Err(e) = outcome {
            assert!(matches!(e, RoomError::RoomClosed(_) | RoomError::RoomNotFound(_)));
        }
    }
    assert_eq!(env.notifier.count_of("room_closed"), 1);
    assert_eq!(env.notifier.count_of("participant_evicted"), 6);
}

#[tokio::test]
async fn test_evict_one_participant() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let bob = TestParticipant::new("bob");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();

    env.manager.evict_participant(&bob.id).await.unwrap();

    assert_eq!(
        env.notifier.events_named("participant_evicted"),
        vec![NotifierEvent::ParticipantEvicted {
            room: "lobby".to_string(),
            participant_id: bob.id.clone(),
        }]
    );
    assert_eq!(
        env.notifier.events_named("participant_left"),
        vec![NotifierEvent::ParticipantLeft {
            room: "lobby".to_string(),
            name: "bob".to_string(),
            remaining: vec![alice.id.clone()],
        }]
    );
    assert_eq!(env.manager.participants("lobby").unwrap().len(), 1);
}

#[tokio::test]
async fn test_evicting_last_participant_closes_room() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();

    env.manager.evict_participant(&alice.id).await.unwrap();

    assert!(env.manager.rooms().is_empty());
    assert_eq!(env.notifier.count_of("room_closed"), 1);
    assert_eq!(env.notifier.count_of("participant_left"), 0);
}

#[tokio::test]
async fn test_close_all_closes_rooms_and_cancels() {
    let env = TestRoomEnv::builder()
        .release_timeout(Duration::from_secs(1))
        .build();
    let token = env.manager.cancellation_token();
    for (n, room) in ["a", "b", "c"].iter().enumerate() {
        let participant = TestParticipant::new(format!("user-{n}"));
        env.manager
            .join_room(&participant.id, &participant.name, room)
            .await
            .unwrap();
    }

    env.manager.close_all().await;

    assert!(env.manager.rooms().is_empty());
    assert!(token.is_cancelled());
    assert_eq!(env.notifier.count_of("room_closed"), 3);
}

#[tokio::test]
async fn test_room_info_serializes() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();

    let info = env.manager.room_info("lobby").unwrap();
    assert_eq!(info.participants, 1);
    assert!(info.has_pipeline);

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json.get("name").unwrap(), "lobby");
    assert_eq!(json.get("engine_id").unwrap(), "engine-0");
    assert_eq!(json.get("publishers").unwrap(), 0);
}
