//! End-to-end turn scenarios against a real redb store.

use std::sync::Arc;
use std::time::Duration;

use parley_ai::scripted::reply_steps;
use parley_ai::{ScriptStep, ScriptedAdapter};
use parley_core::orchestrator::TurnState;
use parley_core::testkit::{FaultyMemoryStore, GatedAdapter, RecordingSink, create_test_store};
use parley_core::{ChannelSink, TurnError, TurnFrame, TurnOrchestrator, TurnPolicy, TurnRequest};
use parley_traits::{ErrorKind, FailureReason, MemoryStore, NewMemory, PartitionKey};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const NPC: &str = "blacksmith_01";
const PLAYER: &str = "player_42";

fn request(text: &str) -> TurnRequest {
    TurnRequest::new(NPC, PLAYER, text)
        .with_persona(json!({"name": "Brom", "values": ["honesty"]}))
        .with_context(json!({"scene": "forge", "player_reputation": 3}))
}

fn pair() -> PartitionKey {
    PartitionKey::new(NPC, PLAYER)
}

fn payload(memory_writes: Value) -> Value {
    json!({
        "utterance": "Well met, traveler. Mind the sparks.",
        "emotion": "happy",
        "style_tags": ["casual"],
        "behavior_directive": "open_shop",
        "memory_writes": memory_writes,
        "public_events": []
    })
}

fn steps_for(payload: Value) -> Vec<ScriptStep> {
    reply_steps(payload)
}

#[tokio::test]
async fn test_turn_on_empty_partition_completes() {
    let (store, _dir) = create_test_store();
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![steps_for(payload(
        json!([]),
    ))]));
    let orchestrator = TurnOrchestrator::new(store.clone(), adapter.clone());

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hello there"), &mut sink, CancellationToken::new())
        .await;

    assert!(outcome.is_complete());
    assert_eq!(
        outcome.transitions,
        vec![
            TurnState::Init,
            TurnState::ContextBuilt,
            TurnState::MemoryRetrieved,
            TurnState::Streaming,
            TurnState::TerminalReceived,
            TurnState::Validated,
            TurnState::Committed,
            TurnState::Complete,
        ]
    );
    assert_eq!(outcome.memories_used, 0);

    let contexts = adapter.contexts();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].memory_count, 0);
    assert!(contexts[0].prompt.contains("- (No prior memories)"));

    let completions = sink.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0.utterance, "Well met, traveler. Mind the sparks.");
    assert!(completions[0].1.is_empty());
    assert!(sink.errors().is_empty());
    assert!(!orchestrator.in_flight().is_in_flight(&pair()));
}

#[tokio::test]
async fn test_tokens_are_forwarded_in_order() {
    let (store, _dir) = create_test_store();
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![steps_for(payload(
        json!([]),
    ))]));
    let orchestrator = TurnOrchestrator::new(store, adapter);

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hello"), &mut sink, CancellationToken::new())
        .await;

    let tokens = sink.tokens();
    assert_eq!(
        tokens,
        vec!["Well ", "met, ", "traveler. ", "Mind ", "the ", "sparks."]
    );
    assert_eq!(outcome.tokens_forwarded, tokens.len());
    assert_eq!(tokens.concat(), "Well met, traveler. Mind the sparks.");
}

#[tokio::test]
async fn test_retrieved_memories_reach_the_prompt() {
    let (store, _dir) = create_test_store();
    for (text, salience) in [
        ("Player saved my daughter", 3),
        ("Player asked about the weather", 0),
        ("Player paid a fair price", 2),
        ("Player haggled hard", 1),
    ] {
        store
            .append(NewMemory::new(&pair(), text, salience))
            .await
            .unwrap();
    }

    let adapter = Arc::new(ScriptedAdapter::new());
    let orchestrator = TurnOrchestrator::new(store, adapter.clone());
    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Remember me?"), &mut sink, CancellationToken::new())
        .await;

    assert!(outcome.is_complete());
    assert_eq!(outcome.memories_used, 3);

    let prompt = &adapter.contexts()[0].prompt;
    assert!(prompt.contains(
        "- (salience 3) Player saved my daughter\n\
         - (salience 2) Player paid a fair price\n\
         - (salience 1) Player haggled hard"
    ));
    assert!(!prompt.contains("weather"));
}

#[tokio::test]
async fn test_stream_ending_without_terminal_fails_incomplete() {
    let (store, _dir) = create_test_store();
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![vec![
        ScriptStep::token("Hel"),
        ScriptStep::token("lo"),
        ScriptStep::disconnect(),
    ]]));
    let orchestrator = TurnOrchestrator::new(store.clone(), adapter);

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hi"), &mut sink, CancellationToken::new())
        .await;

    assert_eq!(outcome.state, TurnState::Failed);
    assert_eq!(sink.tokens(), vec!["Hel", "lo"]);
    match outcome.failure {
        Some(TurnError::Generation(failure)) => {
            assert_eq!(failure.reason, FailureReason::IncompleteStream);
        }
        other => panic!("expected generation failure, got {other:?}"),
    }
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, ErrorKind::GenerationFailure);
    assert!(sink.completions().is_empty());
    assert_eq!(store.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_generation_failure_is_reported() {
    let (store, _dir) = create_test_store();
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![vec![
        ScriptStep::token("Hm"),
        ScriptStep::fail(parley_traits::GenerationFailure::upstream("finish reason SAFETY")),
    ]]));
    let orchestrator = TurnOrchestrator::new(store, adapter);

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hi"), &mut sink, CancellationToken::new())
        .await;

    assert_eq!(outcome.state, TurnState::Failed);
    let errors = sink.errors();
    assert_eq!(errors[0].0, ErrorKind::GenerationFailure);
    assert!(errors[0].1.contains("SAFETY"));
}

#[tokio::test]
async fn test_unknown_emotion_fails_schema_without_writes() {
    let (store, _dir) = create_test_store();
    let mut bad = payload(json!([{"salience": 2, "text": "Player was rude"}]));
    bad["emotion"] = json!("ecstatic");
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![steps_for(bad)]));
    let orchestrator = TurnOrchestrator::new(store.clone(), adapter);

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hi"), &mut sink, CancellationToken::new())
        .await;

    assert_eq!(outcome.state, TurnState::Failed);
    assert_eq!(
        outcome.transitions[outcome.transitions.len() - 2],
        TurnState::TerminalReceived
    );
    match &outcome.failure {
        Some(TurnError::Schema(err)) => assert!(err.has_field("emotion")),
        other => panic!("expected schema error, got {other:?}"),
    }
    assert_eq!(sink.errors()[0].0, ErrorKind::SchemaError);
    assert!(sink.completions().is_empty());
    assert_eq!(store.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_out_of_range_memory_write_rejects_whole_payload() {
    let (store, _dir) = create_test_store();
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![
        steps_for(payload(json!([
            {"salience": 1, "text": "fine"},
            {"salience": 4, "text": "too important"}
        ]))),
        steps_for(payload(json!([{"salience": 2, "text": "z".repeat(161)}]))),
    ]));
    let orchestrator = TurnOrchestrator::new(store.clone(), adapter);

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hi"), &mut sink, CancellationToken::new())
        .await;
    match &outcome.failure {
        Some(TurnError::Schema(err)) => {
            assert_eq!(err.fields(), vec!["memory_writes[1].salience"]);
        }
        other => panic!("expected schema error, got {other:?}"),
    }

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hi again"), &mut sink, CancellationToken::new())
        .await;
    match &outcome.failure {
        Some(TurnError::Schema(err)) => assert!(err.has_field("memory_writes[0].text")),
        other => panic!("expected schema error, got {other:?}"),
    }

    assert_eq!(store.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_partial_commit_failure_still_completes() {
    let (store, _dir) = create_test_store();
    let faulty = Arc::new(FaultyMemoryStore::new(store.clone()).fail_append_call(2));
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![steps_for(payload(
        json!([
            {"salience": 3, "text": "Player returned my hammer", "keys": ["hammer"]},
            {"salience": 1, "text": "Player smelled of smoke"}
        ]),
    ))]));
    let orchestrator = TurnOrchestrator::new(faulty.clone(), adapter);

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Here is your hammer"), &mut sink, CancellationToken::new())
        .await;

    assert!(outcome.is_complete());
    assert_eq!(faulty.append_calls(), 2);
    assert_eq!(outcome.committed.len(), 1);
    assert_eq!(outcome.memory_failures.len(), 1);
    assert_eq!(outcome.memory_failures[0].index, 1);

    let completions = sink.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].1, outcome.memory_failures);
    assert!(completions[0].1[0].message.contains("injected append fault"));

    let stored = store.list_for_subject(NPC, Some(PLAYER), 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text, "Player returned my hammer");
    assert_eq!(stored[0].keys, vec!["hammer".to_string()]);
}

#[tokio::test]
async fn test_replayed_result_writes_duplicates() {
    let (store, _dir) = create_test_store();
    let reply = payload(json!([{"salience": 2, "text": "Player bought a sword"}]));
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![
        steps_for(reply.clone()),
        steps_for(reply),
    ]));
    let orchestrator = TurnOrchestrator::new(store.clone(), adapter);

    for _ in 0..2 {
        let mut sink = RecordingSink::new();
        let outcome = orchestrator
            .run_turn(request("A sword, please"), &mut sink, CancellationToken::new())
            .await;
        assert!(outcome.is_complete());
    }

    let stored = store.list_for_subject(NPC, Some(PLAYER), 10).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|m| m.text == "Player bought a sword"));
    assert_ne!(stored[0].id, stored[1].id);
}

#[tokio::test]
async fn test_concurrent_turn_for_same_pair_is_rejected() {
    let (store, _dir) = create_test_store();
    let gated = Arc::new(GatedAdapter::new(
        vec!["Let ".into(), "me ".into()],
        payload(json!([])),
    ));
    let orchestrator = TurnOrchestrator::new(store, gated.clone());

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut sink = RecordingSink::new();
            let outcome = orchestrator
                .run_turn(request("First"), &mut sink, CancellationToken::new())
                .await;
            (outcome, sink)
        })
    };
    gated.wait_started().await;
    assert!(orchestrator.in_flight().is_in_flight(&pair()));

    let mut sink = RecordingSink::new();
    let rejected = orchestrator
        .run_turn(request("Second"), &mut sink, CancellationToken::new())
        .await;
    assert_eq!(
        rejected.transitions,
        vec![TurnState::Init, TurnState::ContextBuilt, TurnState::Failed]
    );
    assert!(matches!(rejected.failure, Some(TurnError::TurnInProgress(_))));
    assert_eq!(sink.errors()[0].0, ErrorKind::TurnInProgress);
    assert_eq!(gated.calls(), 1);

    // A different counterpart is not blocked. One permit goes to the held
    // first turn, the other to this one.
    gated.release();
    gated.release();
    let mut other_sink = RecordingSink::new();
    let other = orchestrator
        .run_turn(
            TurnRequest::new(NPC, "player_99", "Me too"),
            &mut other_sink,
            CancellationToken::new(),
        )
        .await;
    assert!(other.is_complete());

    let (outcome, first_sink) = first.await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(first_sink.tokens(), vec!["Let ", "me "]);
    assert!(!orchestrator.in_flight().is_in_flight(&pair()));

    gated.release();
    let mut sink = RecordingSink::new();
    let retry = orchestrator
        .run_turn(request("Second"), &mut sink, CancellationToken::new())
        .await;
    assert!(retry.is_complete());
}

#[tokio::test]
async fn test_cancellation_aborts_without_commit() {
    let (store, _dir) = create_test_store();
    let gated = Arc::new(GatedAdapter::new(
        vec!["I ".into(), "remember ".into()],
        payload(json!([{"salience": 3, "text": "never stored"}])),
    ));
    let orchestrator = TurnOrchestrator::new(store.clone(), gated.clone());
    let cancel = CancellationToken::new();

    let turn = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sink = RecordingSink::new();
            let outcome = orchestrator.run_turn(request("Bye"), &mut sink, cancel).await;
            (outcome, sink)
        })
    };
    gated.wait_started().await;
    cancel.cancel();

    let (outcome, sink) = turn.await.unwrap();
    assert_eq!(outcome.state, TurnState::Aborted);
    assert_eq!(
        outcome.transitions[outcome.transitions.len() - 2],
        TurnState::Streaming
    );
    assert_eq!(outcome.tokens_forwarded, 2);
    assert!(outcome.failure.is_none());
    assert!(sink.errors().is_empty());
    assert!(sink.completions().is_empty());
    assert_eq!(store.count(None).await.unwrap(), 0);
    assert!(!orchestrator.in_flight().is_in_flight(&pair()));
}

#[tokio::test]
async fn test_cancellation_after_terminal_payload_is_ignored() {
    let (store, _dir) = create_test_store();
    let cancel = CancellationToken::new();
    let faulty = Arc::new(
        FaultyMemoryStore::new(store.clone()).cancel_on_append(cancel.clone()),
    );
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![steps_for(payload(
        json!([
            {"salience": 2, "text": "Player asked about swords"},
            {"salience": 1, "text": "Player paid in silver"}
        ]),
    ))]));
    let orchestrator = TurnOrchestrator::new(faulty.clone(), adapter);

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("How much?"), &mut sink, cancel.clone())
        .await;

    assert!(cancel.is_cancelled());
    assert!(outcome.is_complete());
    assert_eq!(outcome.committed.len(), 2);
    assert_eq!(faulty.append_calls(), 2);
    assert_eq!(sink.completions().len(), 1);
    assert_eq!(store.count(Some(NPC)).await.unwrap(), 2);
    assert!(orchestrator.in_flight().is_empty());
}

#[tokio::test]
async fn test_full_sink_stops_reading_the_adapter() {
    let (store, _dir) = create_test_store();
    let gated = Arc::new(GatedAdapter::new(
        vec!["One ".into(), "two ".into(), "three ".into(), "four".into()],
        payload(json!([])),
    ));
    let orchestrator = TurnOrchestrator::new(store, gated.clone());
    let cancel = CancellationToken::new();
    let (mut sink, mut frames) = ChannelSink::channel(1);

    let turn = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run_turn(request("Count"), &mut sink, cancel).await })
    };

    // The first token fills the channel; the second is pulled and then
    // waits for room that never comes.
    tokio::time::timeout(Duration::from_secs(5), async {
        while gated.pulled() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gated.pulled(), 2);
    assert!(!turn.is_finished());
    assert!(orchestrator.in_flight().is_in_flight(&pair()));

    cancel.cancel();
    let outcome = turn.await.unwrap();
    assert_eq!(outcome.state, TurnState::Aborted);
    assert_eq!(outcome.tokens_forwarded, 1);
    assert_eq!(gated.pulled(), 2);

    assert_eq!(
        frames.recv().await,
        Some(TurnFrame::Token {
            text: "One ".into()
        })
    );
    assert!(frames.recv().await.is_none());
    assert!(orchestrator.in_flight().is_empty());
}

#[tokio::test]
async fn test_closed_sink_aborts_without_commit() {
    let (store, _dir) = create_test_store();
    let adapter = Arc::new(ScriptedAdapter::from_scripts(vec![steps_for(payload(
        json!([{"salience": 3, "text": "never stored"}]),
    ))]));
    let orchestrator = TurnOrchestrator::new(store.clone(), adapter);

    let mut sink = RecordingSink::close_after_tokens(1);
    let outcome = orchestrator
        .run_turn(request("Hi"), &mut sink, CancellationToken::new())
        .await;

    assert_eq!(outcome.state, TurnState::Aborted);
    assert_eq!(outcome.tokens_forwarded, 1);
    assert_eq!(sink.tokens(), vec!["Well "]);
    assert_eq!(store.count(None).await.unwrap(), 0);
    assert!(!orchestrator.in_flight().is_in_flight(&pair()));
}

#[tokio::test]
async fn test_retrieval_failure_degrades_by_default() {
    let (store, _dir) = create_test_store();
    store
        .append(NewMemory::new(&pair(), "Player stole bread", 3))
        .await
        .unwrap();
    let faulty = Arc::new(FaultyMemoryStore::new(store.clone()).fail_retrieval());
    let adapter = Arc::new(ScriptedAdapter::new());
    let orchestrator = TurnOrchestrator::new(faulty.clone(), adapter.clone());

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hi"), &mut sink, CancellationToken::new())
        .await;

    assert!(outcome.is_complete());
    assert!(outcome.degraded_retrieval);
    assert_eq!(faulty.retrieve_calls(), 1);
    assert_eq!(adapter.contexts()[0].memory_count, 0);
}

#[tokio::test]
async fn test_retrieval_failure_fails_turn_when_strict() {
    let (store, _dir) = create_test_store();
    let faulty = Arc::new(FaultyMemoryStore::new(store).fail_retrieval());
    let adapter = Arc::new(ScriptedAdapter::new());
    let orchestrator = TurnOrchestrator::new(faulty, adapter.clone()).with_policy(TurnPolicy {
        degrade_on_retrieval_failure: false,
    });

    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request("Hi"), &mut sink, CancellationToken::new())
        .await;

    assert_eq!(outcome.state, TurnState::Failed);
    assert!(matches!(outcome.failure, Some(TurnError::Storage(_))));
    assert_eq!(sink.errors()[0].0, ErrorKind::StorageError);
    assert!(sink.tokens().is_empty());
    assert!(adapter.contexts().is_empty());
    assert!(!orchestrator.in_flight().is_in_flight(&pair()));
}

#[tokio::test]
async fn test_malformed_request_names_missing_fields() {
    let (store, _dir) = create_test_store();
    let adapter = Arc::new(ScriptedAdapter::new());
    let orchestrator = TurnOrchestrator::new(store, adapter.clone());

    let request: TurnRequest =
        serde_json::from_value(json!({"player_text": "Hello?", "npc_id": "  "})).unwrap();
    let mut sink = RecordingSink::new();
    let outcome = orchestrator
        .run_turn(request, &mut sink, CancellationToken::new())
        .await;

    assert_eq!(outcome.transitions, vec![TurnState::Init, TurnState::Failed]);
    assert!(outcome.partition.is_none());
    match &outcome.failure {
        Some(TurnError::MalformedRequest(errors)) => {
            let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
            assert_eq!(fields, vec!["npc_id", "player_id"]);
        }
        other => panic!("expected malformed request, got {other:?}"),
    }
    let errors = sink.errors();
    assert_eq!(errors[0].0, ErrorKind::MalformedRequest);
    assert!(errors[0].1.contains("npc_id"));
    assert!(errors[0].1.contains("player_id"));
    assert!(adapter.contexts().is_empty());
}
