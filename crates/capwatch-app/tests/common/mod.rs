//! Shared fixtures for app integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use capwatch_auth::{
    AuthenticatedClient, HttpRequest, HttpResponse, HttpTransport, TransportError,
};
use capwatch_capture::{CaptureBackend, CaptureError, CapturedImage};
use capwatch_core::{BearerToken, CaptureDecision, TokenStore};
use capwatch_scheduler::{CaptureJob, EligibilityCheck, EligibilityCheckError, WallClock};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport answering from a closure and recording every request.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("request log lock").clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    pub fn bearers(&self, path: &str) -> Vec<Option<String>> {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .map(|request| request.header("authorization").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests
            .lock()
            .expect("request log lock")
            .push(request.clone());
        tokio::task::yield_now().await;
        (self.handler)(request)
    }
}

/// Builds a client over `transport` with `initial` already stored.
pub fn client_with_token(
    transport: Arc<ScriptedTransport>,
    initial: Option<&str>,
) -> (Arc<AuthenticatedClient>, Arc<TokenStore>) {
    let store = Arc::new(TokenStore::new());
    if let Some(value) = initial {
        store.set(token(value));
    }
    let client = AuthenticatedClient::new("https://api.example.test", store.clone(), transport)
        .expect("client should build");
    (Arc::new(client), store)
}

pub fn token(value: &str) -> BearerToken {
    BearerToken::new(value).expect("token fixture")
}

pub fn json(status: u16, body: serde_json::Value) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(status, body.to_string()))
}

pub fn eligibility_body(timer_active: bool, checked_in: bool) -> serde_json::Value {
    serde_json::json!({
        "data": {
            "isTimerActive": timer_active,
            "checkInTime": if checked_in {
                serde_json::json!("2026-03-14T08:00:00Z")
            } else {
                serde_json::Value::Null
            },
        }
    })
}

pub fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 14)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .expect("valid fixture time")
}

/// Clock set explicitly by the test.
pub struct ManualClock(Mutex<NaiveDateTime>);

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Arc<Self> {
        Arc::new(Self(Mutex::new(start)))
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.0.lock().expect("clock lock") = now;
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().expect("clock lock")
    }
}

/// Wall clock that follows tokio time, so paused tests move it too.
pub struct TokioClock {
    origin_wall: NaiveDateTime,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(origin_wall: NaiveDateTime) -> Arc<Self> {
        Arc::new(Self {
            origin_wall,
            origin: tokio::time::Instant::now(),
        })
    }
}

impl WallClock for TokioClock {
    fn now(&self) -> NaiveDateTime {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).expect("elapsed fits");
        self.origin_wall + elapsed
    }
}

/// Eligibility answering a fixed decision and recording when it was asked.
pub struct RecordingEligibility {
    decision: CaptureDecision,
    clock: Arc<dyn WallClock>,
    calls: Mutex<Vec<NaiveDateTime>>,
}

impl RecordingEligibility {
    pub fn new(decision: CaptureDecision, clock: Arc<dyn WallClock>) -> Arc<Self> {
        Arc::new(Self {
            decision,
            clock,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<NaiveDateTime> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl EligibilityCheck for RecordingEligibility {
    async fn check(&self) -> Result<CaptureDecision, EligibilityCheckError> {
        self.calls.lock().expect("calls lock").push(self.clock.now());
        Ok(self.decision)
    }
}

/// Job that counts runs and optionally holds each run open.
pub struct CountingJob {
    runs: AtomicUsize,
    hold: Duration,
}

impl CountingJob {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            hold,
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureJob for CountingJob {
    async fn run(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
    }
}

/// Backend whose OS call always fails.
pub struct FailingCaptureBackend;

impl CaptureBackend for FailingCaptureBackend {
    fn capture_png(&self) -> Result<CapturedImage, CaptureError> {
        Err(CaptureError::Backend("display went away".to_string()))
    }
}

/// Number of files currently in `dir`; a missing directory counts as empty.
pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

/// Waits until `condition` holds, yielding to spawned tasks in between.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
