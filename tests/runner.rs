//! Runner lifecycle: streaming, cancellation, deadlines, suspension and
//! resume, archiving, error surface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use branchwork::prelude::*;
use common::*;
use rustc_hash::FxHashMap;
use serde_json::json;

#[tokio::test]
async fn stream_follows_a_live_invocation_to_its_terminal() {
    let root = Arc::new(
        Sequential::new("pipeline", vec![say("one", "first"), say("two", "second")]).unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());

    let mut stream = runner.stream(&id).unwrap();
    let events = stream.collect_segment().await;

    assert_eq!(texts(&events), vec!["first", "second"]);
    assert_eq!(terminal_of(&events), TerminalKind::Completed);
}

#[tokio::test]
async fn late_subscribers_replay_the_full_log_without_gaps_or_duplicates() {
    let root = Arc::new(
        Sequential::new("pipeline", vec![say_many("talker", &["a", "b", "c"])]).unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());
    runner.join(&id).await.unwrap();

    // Subscribing after completion still yields every event, exactly once.
    let mut stream = runner.stream(&id).unwrap();
    let events = stream.collect_segment().await;
    assert_eq!(texts(&events), vec!["a", "b", "c"]);
    assert_eq!(events.len(), 4);
    assert!(events[3].is_terminal());
    assert!(stream.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_sequence_at_the_next_child_boundary() {
    let root = Arc::new(
        Sequential::new(
            "pipeline",
            vec![
                sleeper("slow", 50),
                say("second", "unreachable"),
                say("third", "unreachable"),
            ],
        )
        .unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());

    tokio::time::sleep(Duration::from_millis(10)).await;
    runner.cancel(&id).unwrap();
    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Cancelled);

    let snapshot = runner.snapshot(&id).unwrap();
    // The in-flight child finished its step; nothing after it ran.
    assert_eq!(texts(&snapshot.events), vec!["done sleeping"]);
    assert_eq!(terminal_of(&snapshot.events), TerminalKind::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn a_deadline_expires_between_children() {
    let root = Arc::new(
        Sequential::new(
            "pipeline",
            vec![sleeper("slow", 100), say("late", "unreachable")],
        )
        .unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit_with_options(
        root,
        FxHashMap::default(),
        InvokeOptions::new().with_deadline(Duration::from_millis(50)),
    );

    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::DeadlineExceeded);

    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(texts(&snapshot.events), vec!["done sleeping"]);
    assert_eq!(terminal_of(&snapshot.events), TerminalKind::DeadlineExceeded);
}

#[tokio::test]
async fn suspension_parks_the_invocation_and_resume_continues_it() {
    let root = Arc::new(
        Sequential::new(
            "pipeline",
            vec![
                say("opener", "before gate"),
                approval_gate("gate", "T1"),
                say("closer", "after gate"),
            ],
        )
        .unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());

    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Suspended);
    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(texts(&snapshot.events), vec!["before gate"]);
    assert_eq!(
        terminal_of(&snapshot.events),
        TerminalKind::Suspended {
            correlation_id: "T1".into()
        }
    );

    let mut resumed = runner
        .resume(&id, "T1", json!({"status": "approved"}))
        .unwrap();
    let events = resumed.collect_segment().await;
    // The first post-resume event reflects the merged response.
    assert_eq!(events[0].author, "gate");
    assert_eq!(terminal_of(&events), TerminalKind::Completed);

    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Completed);

    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(
        snapshot.state.get("approval"),
        Some(&json!({"status": "approved"}))
    );
    // The opener did not re-run.
    let befores = texts(&snapshot.events)
        .iter()
        .filter(|text| *text == "before gate")
        .count();
    assert_eq!(befores, 1);
    assert!(texts(&snapshot.events).contains(&"after gate".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspension_inside_parallel_waits_for_siblings_then_parks() {
    let root = Arc::new(
        Parallel::new(
            "fanout",
            vec![
                approval_gate("gate", "P1"),
                set_value("sibling", "sibling_done", json!(true)),
            ],
        )
        .unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());

    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Suspended);
    // The sibling completed and its write merged before parking.
    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(snapshot.state.get("sibling_done"), Some(&json!(true)));

    runner.resume(&id, "P1", json!("go")).unwrap();
    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Completed);

    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(snapshot.state.get("approval"), Some(&json!("go")));
    // The sibling ran exactly once across both segments.
    let sibling_events = snapshot
        .events
        .iter()
        .filter(|event| event.author == "sibling")
        .count();
    assert_eq!(sibling_events, 1);
}

#[tokio::test]
async fn resume_rejects_a_mismatched_correlation_id() {
    let root = approval_gate("gate", "T1");
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());
    runner.join(&id).await.unwrap();

    let err = runner.resume(&id, "WRONG", json!(null)).unwrap_err();
    assert!(matches!(err, RunnerError::CorrelationMismatch { .. }));

    // The suspension is still intact; the right id works.
    runner.resume(&id, "T1", json!("ok")).unwrap();
    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Completed);
}

#[tokio::test]
async fn resume_requires_a_suspended_invocation() {
    let root = say("oneshot", "done");
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());
    runner.join(&id).await.unwrap();

    let err = runner.resume(&id, "T1", json!(null)).unwrap_err();
    assert!(matches!(err, RunnerError::NotSuspended { .. }));
}

#[tokio::test]
async fn unknown_invocations_are_reported() {
    let runner = Runner::default();
    assert!(matches!(
        runner.stream("nope").unwrap_err(),
        RunnerError::UnknownInvocation { .. }
    ));
    assert!(matches!(
        runner.cancel("nope").unwrap_err(),
        RunnerError::UnknownInvocation { .. }
    ));
}

#[tokio::test]
async fn finished_invocations_are_archived_with_state_and_log() {
    let archive = Arc::new(InMemorySnapshotStore::new());
    let runner = Runner::new(RunnerConfig::default()).with_archive(archive.clone());

    let root = Arc::new(
        Sequential::new(
            "pipeline",
            vec![
                set_value("keeper", "app:result", json!("final")),
                set_value("scratcher", "temp:wip", json!(1)),
            ],
        )
        .unwrap(),
    );
    let id = runner.submit(root, FxHashMap::default());
    runner.join(&id).await.unwrap();

    let snapshot = archive.load(&id).await.unwrap().expect("archived");
    assert_eq!(snapshot.status, InvocationStatus::Completed);
    assert_eq!(snapshot.state.get("app:result"), Some(&json!("final")));
    assert!(!snapshot.state.contains_key("temp:wip"));
    assert_eq!(terminal_of(&snapshot.events), TerminalKind::Completed);
}

#[tokio::test]
async fn channel_sinks_forward_events_to_external_consumers() {
    let (sink, rx) = ChannelSink::unbounded();
    let root = say("talker", "ping");
    let runner = Runner::default();
    let id = runner.submit_with_options(
        root,
        FxHashMap::default(),
        InvokeOptions::new().with_sink(sink),
    );
    runner.join(&id).await.unwrap();

    let forwarded: Vec<Event> = rx.drain().collect();
    assert_eq!(texts(&forwarded), vec!["ping"]);
    assert!(forwarded.last().unwrap().is_terminal());
}

#[tokio::test]
async fn memory_sinks_observe_every_event() {
    let sink = MemorySink::new();
    let root = say_many("talker", &["a", "b"]);
    let runner = Runner::default();
    let id = runner.submit_with_options(
        root,
        FxHashMap::default(),
        InvokeOptions::new().with_sink(sink.clone()),
    );
    runner.join(&id).await.unwrap();

    let seen = sink.snapshot();
    assert_eq!(texts(&seen), vec!["a", "b"]);
    assert!(seen.last().unwrap().is_terminal());
}
