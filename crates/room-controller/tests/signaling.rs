//! Candidate exchange and engine event forwarding.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use room_controller::engine::{EndpointTag, EngineEvent, IceCandidate};
use room_test_utils::{test_candidate, NotifierEvent, RecordingNotifier, TestParticipant, TestRoomEnv};

/// Wait until `notifier` has recorded an event named `name`.
async fn wait_for(notifier: &RecordingNotifier, name: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while notifier.count_of(name) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("notification never arrived");
}

fn pipeline_id(env: &TestRoomEnv, room: &str) -> String {
    env.manager
        .room(room)
        .unwrap()
        .pipeline()
        .unwrap()
        .id()
        .to_string()
}

#[tokio::test]
async fn test_publisher_candidates_sent_early_are_flushed_in_order() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();

    for n in 1..=3 {
        env.manager
            .on_ice_candidate(&alice.id, "alice", test_candidate(n))
            .await
            .unwrap();
    }
    env.manager
        .publish_media(&alice.id, &alice.offer(), false, vec![])
        .await
        .unwrap();

    let endpoint = env.engine().endpoint(&alice.id, "alice").unwrap();
    let expected: Vec<String> = (1..=3).map(|n| test_candidate(n).candidate).collect();
    assert_eq!(env.engine().candidates_for(&endpoint), expected);

    // Once installed, candidates go straight through.
    env.manager
        .on_ice_candidate(&alice.id, "alice", test_candidate(4))
        .await
        .unwrap();
    assert_eq!(env.engine().candidates_for(&endpoint).len(), 4);
}

#[tokio::test]
async fn test_subscriber_candidates_wait_for_the_link() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    let bob = TestParticipant::new("bob");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    env.manager.join_room(&bob.id, &bob.name, "lobby").await.unwrap();

    // Bob trickles for alice's stream before alice even publishes.
    env.manager
        .on_ice_candidate(&bob.id, "alice", test_candidate(7))
        .await
        .unwrap();

    env.manager
        .publish_media(&alice.id, &alice.offer(), false, vec![])
        .await
        .unwrap();
    env.manager.subscribe(&bob.id, "alice", &bob.offer()).await.unwrap();

    let endpoint = env.engine().endpoint(&bob.id, "alice").unwrap();
    assert_eq!(
        env.engine().candidates_for(&endpoint),
        vec![test_candidate(7).candidate]
    );
}

#[tokio::test]
async fn test_gathered_candidates_are_forwarded_to_owner() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    let pipeline = pipeline_id(&env, "lobby");

    env.engine()
        .emit(
            &pipeline,
            EngineEvent::CandidateGathered {
                tag: EndpointTag::new(&alice.id, "alice"),
                candidate: test_candidate(1),
            },
        )
        .await;

    wait_for(&env.notifier, "candidate_forwarded").await;
    assert_eq!(
        env.notifier.events_named("candidate_forwarded"),
        vec![NotifierEvent::CandidateForwarded {
            participant_id: alice.id.clone(),
            endpoint_name: "alice".to_string(),
            candidate: test_candidate(1),
        }]
    );
}

#[tokio::test]
async fn test_engine_errors_are_reported() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    let pipeline = pipeline_id(&env, "lobby");

    env.engine()
        .emit(
            &pipeline,
            EngineEvent::ElementError {
                tag: EndpointTag::new(&alice.id, "alice"),
                description: "dtls failure".to_string(),
            },
        )
        .await;
    env.engine()
        .emit(
            &pipeline,
            EngineEvent::PipelineError {
                description: "out of memory".to_string(),
            },
        )
        .await;

    wait_for(&env.notifier, "pipeline_error").await;
    assert_eq!(
        env.notifier.events_named("element_error"),
        vec![NotifierEvent::ElementError {
            participant_id: alice.id.clone(),
            description: "dtls failure".to_string(),
        }]
    );
    assert_eq!(
        env.notifier.events_named("pipeline_error"),
        vec![NotifierEvent::PipelineError {
            room: "lobby".to_string(),
            participants: vec![alice.id.clone()],
            description: "out of memory".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_events_after_close_are_dropped() {
    let env = TestRoomEnv::new();
    let alice = TestParticipant::new("alice");
    env.manager.join_room(&alice.id, &alice.name, "lobby").await.unwrap();
    let pipeline = pipeline_id(&env, "lobby");
    let room = env.manager.room("lobby").unwrap();

    env.manager.close_room("lobby").await.unwrap();
    assert!(room.is_closed());
    env.engine()
        .emit(
            &pipeline,
            EngineEvent::PipelineError {
                description: "late".to_string(),
            },
        )
        .await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(env.notifier.count_of("pipeline_error"), 0);
}

#[test]
fn test_candidate_wire_format_is_camel_case() {
    let candidate = IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 5000 typ host", "audio", 1);
    let json = serde_json::to_value(&candidate).unwrap();

    assert_eq!(json.get("sdpMid").unwrap(), "audio");
    assert_eq!(json.get("sdpMLineIndex").unwrap(), 1);

    let back: IceCandidate = serde_json::from_value(json).unwrap();
    assert_eq!(back, candidate);
}
