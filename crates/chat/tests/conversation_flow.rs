mod support;

use std::time::Duration;

use phoenix_chat::{
    ChatBoundary, ChatError, ControllerConfig, DisplayMessage, ERROR_PLACEHOLDER, ExchangePhase,
    SubmitOutcome,
};
use phoenix_llm::StreamEventPayload;
use phoenix_storage::Turn;

use support::{Harness, Script, wait_for_state};

#[tokio::test]
async fn streamed_reply_is_shown_and_persisted() {
    let harness = Harness::new(vec![Script::deltas_then_done(&["Hi", " there"])]);
    harness.controller.initialize().await;

    let task = harness.controller.submit("Hello").into_task().unwrap();
    task.wait().await;

    let state = harness.controller.snapshot();
    assert_eq!(
        state.messages,
        vec![DisplayMessage::user("Hello"), DisplayMessage::ai("Hi there")]
    );
    assert!(!state.is_awaiting_first_token);
    assert_eq!(
        harness.store.load().await,
        vec![Turn::user("Hello"), Turn::model("Hi there")]
    );
    assert_eq!(harness.controller.phase(), ExchangePhase::Idle);
}

#[tokio::test]
async fn transport_failure_shows_placeholder_and_persists_nothing() {
    let harness = Harness::new(vec![Script::Replay(vec![StreamEventPayload::Error(
        "connection reset".to_string(),
    )])]);
    harness.controller.initialize().await;

    harness.controller.submit("Hello").into_task().unwrap().wait().await;

    let state = harness.controller.snapshot();
    assert_eq!(
        state.messages,
        vec![
            DisplayMessage::user("Hello"),
            DisplayMessage::ai(ERROR_PLACEHOLDER)
        ]
    );
    assert!(!state.is_awaiting_first_token);
    assert!(harness.store.load().await.is_empty());
}

#[tokio::test]
async fn refused_stream_is_handled_like_a_transport_failure() {
    let harness = Harness::new(vec![Script::Refuse]);
    harness.controller.initialize().await;

    harness.controller.submit("Hello").into_task().unwrap().wait().await;

    assert_eq!(
        harness.controller.snapshot().messages[1],
        DisplayMessage::ai(ERROR_PLACEHOLDER)
    );
    assert!(harness.store.load().await.is_empty());
}

#[tokio::test]
async fn failure_mid_stream_replaces_the_partial_reply() {
    let harness = Harness::new(vec![Script::Replay(vec![
        StreamEventPayload::Delta("Hi".to_string()),
        StreamEventPayload::Error("stream broke".to_string()),
    ])]);
    harness.controller.initialize().await;

    harness.controller.submit("Hello").into_task().unwrap().wait().await;

    let state = harness.controller.snapshot();
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.messages[1], DisplayMessage::ai(ERROR_PLACEHOLDER));
    assert!(harness.store.load().await.is_empty());
}

#[tokio::test]
async fn stream_closing_without_terminal_event_fails_the_exchange() {
    let (script, sender) = Script::manual();
    let harness = Harness::new(vec![script]);
    harness.controller.initialize().await;

    let task = harness.controller.submit("Hello").into_task().unwrap();
    sender
        .send(StreamEventPayload::Delta("partial".to_string()))
        .unwrap();
    drop(sender);
    task.wait().await;

    assert_eq!(
        harness.controller.snapshot().messages[1],
        DisplayMessage::ai(ERROR_PLACEHOLDER)
    );
}

#[tokio::test]
async fn blank_submissions_change_nothing() {
    let harness = Harness::new(vec![]);
    harness.controller.initialize().await;

    for text in ["", "   ", "\n\t"] {
        assert!(matches!(
            harness.controller.submit(text),
            SubmitOutcome::Ignored
        ));
    }

    assert!(harness.controller.snapshot().messages.is_empty());
    assert!(harness.provider.requests().is_empty());
    assert!(harness.store.load().await.is_empty());
}

#[tokio::test]
async fn every_completed_exchange_adds_one_turn_pair() {
    let harness = Harness::new(vec![
        Script::deltas_then_done(&["one"]),
        Script::deltas_then_done(&["t", "w", "o"]),
        Script::deltas_then_done(&["three"]),
    ]);
    harness.controller.initialize().await;

    for (completed, prompt) in ["first", "second", "third"].into_iter().enumerate() {
        harness.controller.submit(prompt).into_task().unwrap().wait().await;

        let state = harness.controller.snapshot();
        let turns = harness.store.load().await;
        assert_eq!(state.messages.len(), 2 * (completed + 1));
        assert_eq!(turns.len(), 2 * (completed + 1));
        for (message, turn) in state.messages.iter().zip(&turns) {
            assert_eq!(message, &DisplayMessage::from(turn));
        }
    }

    let requests = harness.provider.requests();
    assert_eq!(
        requests[2].history,
        vec![
            Turn::user("first"),
            Turn::model("one"),
            Turn::user("second"),
            Turn::model("two"),
        ]
    );
}

#[tokio::test]
async fn initialize_twice_does_not_duplicate_history() {
    let harness = Harness::new(vec![Script::deltas_then_done(&["ok"])]);
    harness
        .store
        .append(&[Turn::user("earlier"), Turn::model("reply")])
        .await
        .unwrap();

    harness.controller.initialize().await;
    harness.controller.initialize().await;

    assert_eq!(
        harness.controller.snapshot().messages,
        vec![DisplayMessage::user("earlier"), DisplayMessage::ai("reply")]
    );

    harness.controller.submit("next").into_task().unwrap().wait().await;
    let requests = harness.provider.requests();
    assert_eq!(
        requests[0].history,
        vec![Turn::user("earlier"), Turn::model("reply")]
    );
}

#[tokio::test]
async fn streaming_message_is_unique_and_trailing() {
    let (script, sender) = Script::manual();
    let harness = Harness::new(vec![script]);
    harness.controller.initialize().await;
    let mut receiver = harness.controller.subscribe();

    let task = harness.controller.submit("Hello").into_task().unwrap();
    let state = wait_for_state(&mut receiver, |state| state.is_awaiting_first_token).await;
    assert!(state.messages.iter().all(|message| !message.is_streaming));

    let mut previous_len = 0;
    let mut cumulative = String::new();
    for chunk in ["Hi", " there", ", friend"] {
        cumulative.push_str(chunk);
        sender
            .send(StreamEventPayload::Delta(chunk.to_string()))
            .unwrap();
        let expected = cumulative.clone();
        let state = wait_for_state(&mut receiver, |state| {
            state.messages.last().map(|message| message.text.as_str()) == Some(expected.as_str())
        })
        .await;

        let streaming = state
            .messages
            .iter()
            .filter(|message| message.is_streaming)
            .count();
        assert_eq!(streaming, 1);
        assert!(state.messages.last().unwrap().is_streaming);
        assert!(!state.is_awaiting_first_token);
        assert!(state.messages.last().unwrap().text.len() >= previous_len);
        previous_len = state.messages.last().unwrap().text.len();
    }

    sender.send(StreamEventPayload::Done).unwrap();
    task.wait().await;
    assert!(
        harness
            .controller
            .snapshot()
            .messages
            .iter()
            .all(|message| !message.is_streaming)
    );
}

#[tokio::test]
async fn submit_during_flight_is_rejected_without_corrupting_the_stream() {
    let (script, sender) = Script::manual();
    let harness = Harness::new(vec![script]);
    harness.controller.initialize().await;
    let mut receiver = harness.controller.subscribe();

    let task = harness.controller.submit("Hello").into_task().unwrap();
    assert!(matches!(
        harness.controller.submit("Too soon"),
        SubmitOutcome::Rejected
    ));

    sender.send(StreamEventPayload::Delta("Hi".to_string())).unwrap();
    wait_for_state(&mut receiver, |state| state.messages.len() == 2).await;
    assert!(matches!(
        harness.controller.submit("Still streaming"),
        SubmitOutcome::Rejected
    ));

    sender
        .send(StreamEventPayload::Delta(" there".to_string()))
        .unwrap();
    sender.send(StreamEventPayload::Done).unwrap();
    task.wait().await;

    assert_eq!(
        harness.controller.snapshot().messages,
        vec![DisplayMessage::user("Hello"), DisplayMessage::ai("Hi there")]
    );
    assert_eq!(harness.provider.requests().len(), 1);
}

#[tokio::test]
async fn clear_during_stream_discards_stale_deltas() {
    let (script, sender) = Script::manual();
    let harness = Harness::new(vec![script, Script::deltas_then_done(&["fresh"])]);
    harness
        .store
        .append(&[Turn::user("old"), Turn::model("old reply")])
        .await
        .unwrap();
    harness.controller.initialize().await;
    let mut receiver = harness.controller.subscribe();

    let task = harness.controller.submit("Hello").into_task().unwrap();
    sender.send(StreamEventPayload::Delta("Hi".to_string())).unwrap();
    wait_for_state(&mut receiver, |state| state.messages.len() == 4).await;

    harness.controller.clear_history().await.unwrap();

    // The stale stream keeps talking after the clear; none of it may land.
    let _ = sender.send(StreamEventPayload::Delta(" there".to_string()));
    let _ = sender.send(StreamEventPayload::Done);
    task.wait().await;

    assert!(harness.controller.snapshot().messages.is_empty());
    assert!(!harness.controller.snapshot().is_awaiting_first_token);
    assert!(harness.store.load().await.is_empty());
    assert_eq!(harness.controller.phase(), ExchangePhase::Idle);

    harness.controller.submit("Again").into_task().unwrap().wait().await;
    let requests = harness.provider.requests();
    assert!(requests[1].history.is_empty());
    assert_eq!(
        harness.store.load().await,
        vec![Turn::user("Again"), Turn::model("fresh")]
    );
}

#[tokio::test]
async fn clear_after_completion_wipes_the_appended_exchange() {
    let harness = Harness::new(vec![Script::deltas_then_done(&["Hi"])]);
    harness.controller.initialize().await;

    let task = harness.controller.submit("Hello").into_task().unwrap();
    task.wait().await;
    harness.controller.clear_history().await.unwrap();

    assert!(harness.controller.snapshot().messages.is_empty());
    assert!(harness.store.load().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleared_snapshot_is_never_published_before_model_context_resets() {
    let harness = Harness::new(vec![]);
    harness
        .store
        .append(&[Turn::user("old"), Turn::model("old reply")])
        .await
        .unwrap();
    harness.controller.initialize().await;
    assert_eq!(harness.controller.model_context_len(), 2);

    let mut receiver = harness.controller.subscribe();
    let observer = harness.controller.clone();
    let watcher = tokio::spawn(async move {
        wait_for_state(&mut receiver, |state| state.messages.is_empty()).await;
        observer.model_context_len()
    });

    harness.controller.clear_history().await.unwrap();

    assert_eq!(watcher.await.unwrap(), 0);
    assert_eq!(harness.controller.model_context_len(), 0);
}

#[tokio::test]
async fn clear_while_append_is_pending_leaves_nothing_behind() {
    let harness = Harness::new(vec![
        Script::deltas_then_done(&["Hi"]),
        Script::deltas_then_done(&["fresh"]),
    ]);
    harness.controller.initialize().await;
    let held = harness.backend.hold_next_write();

    let task = harness.controller.submit("Hello").into_task().unwrap();
    held.started.notified().await;
    assert_eq!(
        harness.controller.snapshot().messages,
        vec![DisplayMessage::user("Hello"), DisplayMessage::ai("Hi")]
    );

    let controller = harness.controller.clone();
    let clear = tokio::spawn(async move { controller.clear_history().await });
    tokio::task::yield_now().await;
    assert!(!clear.is_finished());

    held.release.notify_one();
    task.wait().await;
    clear.await.unwrap().unwrap();

    assert!(harness.controller.snapshot().messages.is_empty());
    assert!(harness.store.load().await.is_empty());

    assert_eq!(harness.controller.model_context_len(), 0);

    harness.controller.submit("Again").into_task().unwrap().wait().await;
    assert!(harness.provider.requests()[1].history.is_empty());
}

#[tokio::test]
async fn persistence_failure_keeps_the_conversation_going() {
    let harness = Harness::new(vec![
        Script::deltas_then_done(&["unsaved"]),
        Script::deltas_then_done(&["saved"]),
    ]);
    harness.controller.initialize().await;
    harness.backend.set_fail_writes(true);

    harness.controller.submit("first").into_task().unwrap().wait().await;

    assert_eq!(harness.controller.snapshot().messages.len(), 2);
    assert!(harness.controller.last_persistence_error().is_some());
    assert!(harness.store.load().await.is_empty());

    harness.backend.set_fail_writes(false);
    harness.controller.submit("second").into_task().unwrap().wait().await;

    assert_eq!(harness.controller.snapshot().messages.len(), 4);
    assert!(harness.controller.last_persistence_error().is_none());
    assert_eq!(
        harness.store.load().await,
        vec![Turn::user("second"), Turn::model("saved")]
    );
}

#[tokio::test]
async fn failed_store_wipe_leaves_everything_in_place() {
    let harness = Harness::new(vec![Script::deltas_then_done(&["Hi"])]);
    harness.controller.initialize().await;
    harness.controller.submit("Hello").into_task().unwrap().wait().await;
    harness.backend.set_fail_writes(true);

    let error = harness.controller.clear_history().await.unwrap_err();

    assert!(matches!(error, ChatError::Storage { .. }));
    assert_eq!(harness.controller.snapshot().messages.len(), 2);
    assert_eq!(harness.store.load().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn response_delay_holds_back_the_first_update() {
    let delay = Duration::from_millis(750);
    let harness = Harness::with_config(
        vec![Script::deltas_then_done(&["Hi"])],
        ControllerConfig::with_response_delay(delay),
    );
    harness.controller.initialize().await;

    let started = tokio::time::Instant::now();
    let task = harness.controller.submit("Hello").into_task().unwrap();
    assert!(harness.controller.snapshot().is_awaiting_first_token);
    assert!(harness.provider.requests().is_empty());

    task.wait().await;

    assert!(started.elapsed() >= delay);
    assert_eq!(harness.controller.snapshot().messages[1], DisplayMessage::ai("Hi"));
}

#[tokio::test]
async fn reconfigure_swaps_the_response_delay() {
    let harness = Harness::new(vec![]);
    let config = ControllerConfig::with_response_delay(Duration::from_millis(20));

    harness.controller.reconfigure(config);

    assert_eq!(harness.controller.config(), config);
}

#[tokio::test]
async fn delete_prompt_requires_history_and_confirmation() {
    let harness = Harness::new(vec![Script::deltas_then_done(&["Hi"])]);
    harness.controller.initialize().await;
    let boundary = ChatBoundary::new(harness.controller.clone());

    assert!(!boundary.request_delete());
    assert!(!boundary.is_delete_prompt_visible());

    boundary.submit("Hello").into_task().unwrap().wait().await;
    assert!(boundary.request_delete());
    assert!(boundary.is_delete_prompt_visible());

    boundary.cancel_delete();
    assert!(!boundary.is_delete_prompt_visible());
    assert_eq!(boundary.snapshot().messages.len(), 2);
    assert_eq!(harness.store.load().await.len(), 2);

    assert!(boundary.request_delete());
    boundary.confirm_delete().await.unwrap();

    assert!(!boundary.is_delete_prompt_visible());
    assert!(boundary.snapshot().messages.is_empty());
    assert!(harness.store.load().await.is_empty());
}
