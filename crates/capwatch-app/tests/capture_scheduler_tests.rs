//! Integration tests for tick gating, overlap control and hourly resync.

mod common;

use std::sync::Arc;
use std::time::Duration;

use capwatch_auth::{REFRESH_PATH, TransportError};
use capwatch_capture::SyntheticCaptureBackend;
use capwatch_core::CaptureDecision;
use capwatch_scheduler::{
    CaptureScheduler, ELIGIBILITY_PATH, RemoteEligibility, ScheduleWindow, SchedulerOptions,
    TickOutcome, minute_start,
};
use capwatch_upload::{CapturePipeline, UPLOAD_PATH};
use chrono::Timelike;
use common::{
    CountingJob, ManualClock, RecordingEligibility, ScriptedTransport, TokioClock, at,
    client_with_token, eligibility_body, eventually, file_count, json,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const POSITIVE: CaptureDecision = CaptureDecision {
    timer_active: true,
    checked_in: true,
};

fn options(capture_on_eligible: bool) -> SchedulerOptions {
    SchedulerOptions {
        window: ScheduleWindow::default(),
        capture_on_eligible,
    }
}

#[tokio::test]
async fn capture_scheduler_tests_negative_eligibility_skips_pipeline() {
    let transport = ScriptedTransport::new(|_| json(200, eligibility_body(false, false)));
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let clock = ManualClock::new(at(10, 0, 0));
    let job = CountingJob::new(Duration::ZERO);
    let scheduler = CaptureScheduler::new(
        options(true),
        clock,
        Arc::new(RemoteEligibility::new(client)),
        job.clone(),
    );

    let outcome = scheduler.on_tick().await;

    assert_eq!(outcome, TickOutcome::Declined(CaptureDecision::NEGATIVE));
    assert_eq!(transport.count(ELIGIBILITY_PATH), 1);
    assert_eq!(job.runs(), 0);
}

#[tokio::test]
async fn capture_scheduler_tests_checked_in_without_timer_is_negative() {
    let transport = ScriptedTransport::new(|_| json(200, eligibility_body(false, true)));
    let (client, _store) = client_with_token(transport, Some("abc"));
    let job = CountingJob::new(Duration::ZERO);
    let scheduler = CaptureScheduler::new(
        options(true),
        ManualClock::new(at(10, 0, 0)),
        Arc::new(RemoteEligibility::new(client)),
        job.clone(),
    );

    assert!(matches!(scheduler.on_tick().await, TickOutcome::Declined(_)));
    assert_eq!(job.runs(), 0);
}

#[tokio::test]
async fn capture_scheduler_tests_blackout_minute_makes_no_request() {
    let transport = ScriptedTransport::new(|_| json(200, eligibility_body(true, true)));
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let job = CountingJob::new(Duration::ZERO);
    let scheduler = CaptureScheduler::new(
        options(true),
        ManualClock::new(at(14, 3, 20)),
        Arc::new(RemoteEligibility::new(client)),
        job.clone(),
    );

    assert_eq!(scheduler.on_tick().await, TickOutcome::Blackout);
    assert!(transport.requests().is_empty());
    assert_eq!(job.runs(), 0);
}

#[tokio::test]
async fn capture_scheduler_tests_check_runs_even_when_capture_is_off() {
    let transport = ScriptedTransport::new(|_| json(200, eligibility_body(true, true)));
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let job = CountingJob::new(Duration::ZERO);
    let scheduler = CaptureScheduler::new(
        options(false),
        ManualClock::new(at(10, 0, 0)),
        Arc::new(RemoteEligibility::new(client)),
        job.clone(),
    );

    assert_eq!(scheduler.on_tick().await, TickOutcome::CaptureDisabled);
    assert_eq!(transport.count(ELIGIBILITY_PATH), 1);
    assert_eq!(job.runs(), 0);
}

#[tokio::test]
async fn capture_scheduler_tests_failed_check_is_negative_and_next_tick_proceeds() {
    let transport = ScriptedTransport::new(|_| Err(TransportError("offline".to_string())));
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let clock = ManualClock::new(at(10, 0, 0));
    let job = CountingJob::new(Duration::ZERO);
    let scheduler = CaptureScheduler::new(
        options(true),
        clock.clone(),
        Arc::new(RemoteEligibility::new(client)),
        job.clone(),
    );

    assert_eq!(scheduler.on_tick().await, TickOutcome::CheckFailed);
    clock.set(at(10, 1, 0));
    assert_eq!(scheduler.on_tick().await, TickOutcome::CheckFailed);
    assert_eq!(transport.count(ELIGIBILITY_PATH), 2);
    assert_eq!(transport.count(REFRESH_PATH), 0);
    assert_eq!(job.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn capture_scheduler_tests_in_flight_run_coalesces_next_tick() {
    let clock = ManualClock::new(at(10, 0, 0));
    let eligibility = RecordingEligibility::new(POSITIVE, clock.clone());
    let job = CountingJob::new(Duration::from_secs(90));
    let scheduler = CaptureScheduler::new(options(true), clock.clone(), eligibility, job.clone());

    assert_eq!(scheduler.on_tick().await, TickOutcome::CaptureStarted);
    clock.set(at(10, 1, 0));
    assert_eq!(scheduler.on_tick().await, TickOutcome::CaptureCoalesced);
    assert!(eventually(|| job.runs() == 1).await);
    assert!(scheduler.capture_in_flight());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!scheduler.capture_in_flight());

    clock.set(at(10, 2, 0));
    assert_eq!(scheduler.on_tick().await, TickOutcome::CaptureStarted);
    assert!(eventually(|| job.runs() == 2).await);
}

#[tokio::test]
async fn capture_scheduler_tests_upload_failure_keeps_scheduler_ticking() {
    let dir = tempfile::tempdir().expect("temp dir");
    let transport = ScriptedTransport::new(|request| {
        if request.path == UPLOAD_PATH {
            json(500, json!({ "error": "storage unavailable" }))
        } else {
            json(200, eligibility_body(true, true))
        }
    });
    let (client, _store) = client_with_token(transport.clone(), Some("abc"));
    let pipeline = Arc::new(CapturePipeline::new(
        client.clone(),
        Arc::new(SyntheticCaptureBackend::new()),
        dir.path(),
    ));
    let clock = ManualClock::new(at(10, 0, 0));
    let scheduler = CaptureScheduler::new(
        options(true),
        clock.clone(),
        Arc::new(RemoteEligibility::new(client)),
        pipeline,
    );

    assert_eq!(scheduler.on_tick().await, TickOutcome::CaptureStarted);
    assert!(eventually(|| !scheduler.capture_in_flight()).await);
    assert_eq!(file_count(dir.path()), 0);

    clock.set(at(10, 1, 0));
    assert_eq!(scheduler.on_tick().await, TickOutcome::CaptureStarted);
    assert!(eventually(|| !scheduler.capture_in_flight()).await);

    assert_eq!(transport.count(UPLOAD_PATH), 2);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test(start_paused = true)]
async fn capture_scheduler_tests_two_hours_of_ticks_respect_blackout_and_resync() {
    let clock = TokioClock::starting_at(at(10, 1, 30));
    let eligibility = RecordingEligibility::new(CaptureDecision::NEGATIVE, clock.clone());
    let job = CountingJob::new(Duration::ZERO);
    let scheduler = Arc::new(CaptureScheduler::new(
        options(true),
        clock,
        eligibility.clone(),
        job.clone(),
    ));
    let cancel = CancellationToken::new();
    let running = tokio::spawn(scheduler.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(2 * 3_600)).await;
    cancel.cancel();
    running.await.expect("scheduler stops");

    let calls = eligibility.calls();
    assert!(calls.iter().all(|call| call.minute() != 3));

    let mut minutes: Vec<_> = calls.iter().copied().map(minute_start).collect();
    minutes.dedup();
    assert_eq!(minutes.len(), calls.len(), "one decision per minute");

    assert!(calls.contains(&at(10, 2, 30)));
    assert!(calls.contains(&at(10, 59, 30)));
    assert!(calls.contains(&at(11, 0, 0)), "resync restarts on the hour");
    assert!(calls.contains(&at(11, 4, 0)), "blackout leaves the realigned tick alone");
    assert!(calls.contains(&at(12, 0, 0)));
    assert_eq!(calls.len(), 57 + 59 + 2);
    assert_eq!(job.runs(), 0);
}
