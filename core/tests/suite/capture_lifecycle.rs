#![cfg(unix)]

use std::time::Duration;

use pretty_assertions::assert_eq;
use tapedeck_core::OrchestratorError;
use tapedeck_core::capture::{CaptureError, CaptureState, DeviceAction};
use tapedeck_core::events::{EventRecv, Operation};
use tapedeck_core::pipeline::{JobKind, PipelineJobRequest};

use super::support::{Harness, next_status};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_is_refused_and_operator_stop_returns_to_idle() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();

    let session = orch.start_capture("X", "2020", true).await.unwrap();
    assert_eq!(session.part_index, 1);
    assert_eq!(session.state, CaptureState::Capturing);
    assert!(session.auto_rewind_play);
    assert_eq!(harness.deck_actions(), vec!["rewind", "play"]);
    let rewind = next_status(&mut events, Operation::Capture, "device_control").await;
    assert_eq!(rewind.payload["action"], "rewind");
    let play = next_status(&mut events, Operation::Capture, "device_control").await;
    assert_eq!(play.payload["action"], "play");
    let started = next_status(&mut events, Operation::Capture, "started").await;
    assert_eq!(started.payload["title"], "X");
    assert_eq!(started.payload["year"], "2020");
    assert!(started.payload.contains_key("started_at"));

    let err = orch.start_capture("Y", "2021", false).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Capture(CaptureError::AlreadyCapturing { ref title, .. }) if title == "X"
    ));
    let current = orch.current_session().await.unwrap();
    assert_eq!(current.title, "X");
    assert_eq!(current.state, CaptureState::Capturing);

    assert_eq!(orch.stop_capture().await.unwrap(), CaptureState::Stopping);
    next_status(&mut events, Operation::Capture, "stopping").await;
    let stopped = next_status(&mut events, Operation::Capture, "stopped").await;
    assert_eq!(stopped.payload["reason"], "operator");
    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
    assert!(orch.current_session().await.is_none());

    let key = tapedeck_core::project::ProjectKey::new("X", "2020").unwrap();
    assert!(orch.store().part_path(&key, 1).is_file());

    // Stopping again is a harmless no-op.
    assert_eq!(orch.stop_capture().await.unwrap(), CaptureState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tape_end_is_observed_without_a_stop_request() {
    let harness = Harness::new().with_device("tape-end");
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();

    orch.start_capture("Urlaub", "2001", false).await.unwrap();
    next_status(&mut events, Operation::Capture, "stopping").await;
    let stopped = next_status(&mut events, Operation::Capture, "stopped").await;
    assert_eq!(stopped.payload["reason"], "device_ended");
    assert_eq!(stopped.payload["exit_code"], 0);

    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
    assert_eq!(orch.capture_state(), CaptureState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_tool_reports_failure_with_stderr() {
    let harness = Harness::new().with_device("crash");
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();

    orch.start_capture("Urlaub", "2001", false).await.unwrap();
    let stopped = next_status(&mut events, Operation::Capture, "stopped").await;
    assert_eq!(stopped.payload["reason"], "failed");
    assert_eq!(stopped.payload["exit_code"], 3);
    let error = stopped.payload["error"].as_str().unwrap();
    assert!(error.contains("device on fire"), "{error}");
    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresponsive_tool_is_escalated_after_the_grace_period() {
    let mut harness = Harness::new().with_device("stubborn");
    harness.config.capture.stop_grace_secs = 0;
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();

    orch.start_capture("Urlaub", "2001", false).await.unwrap();
    orch.stop_capture().await.unwrap();
    let stopped = next_status(&mut events, Operation::Capture, "stopped").await;
    assert_eq!(stopped.payload["reason"], "operator");
    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parts_are_numbered_across_sessions_and_periods_alternate() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();

    for expected in 1..=3 {
        let session = orch.start_capture("Hochzeit", "1999", false).await.unwrap();
        assert_eq!(session.part_index, expected);
        orch.stop_capture().await.unwrap();
        assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
    }

    let mut statuses = Vec::new();
    while let Some(EventRecv::Event(event)) = events.try_recv() {
        if event.operation == Operation::Capture {
            if let Some(status) = event.status() {
                if status == "started" || status == "stopped" {
                    statuses.push(status.to_string());
                }
            }
        }
    }
    assert_eq!(
        statuses,
        vec!["started", "stopped", "started", "stopped", "started", "stopped"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_capture_binary_is_a_launch_failure() {
    let mut harness = Harness::new();
    harness.config.paths.ffmpeg_path = harness.tmp.path().join("no-such-ffmpeg");
    let orch = harness.orchestrator();

    let err = orch.start_capture("Urlaub", "2001", false).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Capture(CaptureError::LaunchFailed { .. })
    ));
    assert_eq!(orch.capture_state(), CaptureState::Idle);
    // The session is usable again after a failed launch.
    assert!(orch.current_session().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn jobs_for_the_capturing_project_are_refused() {
    let harness = Harness::new();
    let orch = harness.orchestrator();
    orch.start_capture("Urlaub", "2001", false).await.unwrap();

    let request = PipelineJobRequest::new(
        JobKind::ExportOnly,
        vec![harness.tmp.path().join("whatever_4k.mp4")],
        "Urlaub",
        "2001",
    );
    let err = orch.enqueue(request).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ProjectBusy { .. }));

    let other = PipelineJobRequest::new(
        JobKind::ExportOnly,
        vec![harness.tmp.path().join("whatever_4k.mp4")],
        "Anders",
        "2002",
    );
    assert!(orch.enqueue(other).await.is_ok());

    orch.stop_capture().await.unwrap();
    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_exit_is_seen_while_a_background_child_holds_its_pipes() {
    let harness = Harness::new().with_device("detached");
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();

    orch.start_capture("Urlaub", "2001", false).await.unwrap();
    let stopped = next_status(&mut events, Operation::Capture, "stopped").await;
    assert_eq!(stopped.payload["reason"], "device_ended");
    assert_eq!(stopped.payload["exit_code"], 0);
    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);

    let again = orch.start_capture("Urlaub", "2001", false).await.unwrap();
    assert_eq!(again.part_index, 2);
    next_status(&mut events, Operation::Capture, "stopped").await;
    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn jammed_deck_refuses_the_start_without_recording() {
    let harness = Harness::new();
    harness.jam_deck();
    let orch = harness.orchestrator();
    let mut events = orch.subscribe();

    let err = orch.start_capture("Urlaub", "2001", true).await.unwrap_err();
    match err {
        OrchestratorError::Capture(CaptureError::DeviceControl { reason }) => {
            assert!(reason.contains("tape jammed during rewind"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    let failed = next_status(&mut events, Operation::Capture, "device_control_failed").await;
    assert_eq!(failed.payload["action"], "rewind");
    assert_eq!(orch.capture_state(), CaptureState::Idle);
    assert!(orch.capture().active_project().await.is_none());
    assert!(harness.tool_calls().is_empty(), "{:?}", harness.tool_calls());

    // Without auto rewind the deck is left alone and capture works.
    orch.start_capture("Urlaub", "2001", false).await.unwrap();
    orch.stop_capture().await.unwrap();
    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deck_can_be_driven_by_hand_only_while_idle() {
    let harness = Harness::new();
    let orch = harness.orchestrator();

    orch.control_device(DeviceAction::Pause).await.unwrap();
    assert_eq!(harness.deck_actions(), vec!["pause"]);

    orch.start_capture("Urlaub", "2001", false).await.unwrap();
    let err = orch.control_device(DeviceAction::Rewind).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Capture(CaptureError::DeviceControl { .. })
    ));
    assert_eq!(harness.deck_actions(), vec!["pause"]);

    orch.stop_capture().await.unwrap();
    assert!(orch.capture().wait_idle(Duration::from_secs(5)).await);
}
