#![warn(missing_docs)]
//! # capwatch-scheduler
//!
//! ## Purpose
//! Decides once per wall-clock minute whether a screen capture should be
//! taken, and keeps the tick anchored to the wall clock.
//!
//! ## Responsibilities
//! - Run a repeating tick and skip the configured blackout minute.
//! - Query the `/can-capture` eligibility endpoint on every other tick.
//! - Trigger a [`CaptureJob`] on positive decisions without overlapping runs.
//! - Recreate the tick at the top of every hour to shed timer drift.
//!
//! ## Data flow
//! tick -> [`ScheduleWindow::tick`] -> [`EligibilityCheck::check`] ->
//! [`CaptureDecision`] -> [`CaptureJob::run`] (spawned, one at a time).
//! resync timer -> [`ScheduleWindow::resync`] -> fresh tick.
//!
//! ## Error model
//! Eligibility failures are [`EligibilityCheckError`] and count as a negative
//! decision for that tick. Invalid windows are rejected at construction with
//! [`SchedulerError`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use capwatch_auth::{AuthenticatedClient, HttpError, HttpMethod};
use capwatch_core::CaptureDecision;
use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Path of the eligibility endpoint.
pub const ELIGIBILITY_PATH: &str = "/can-capture";

/// Default tick period.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(60);

/// Default minute of each hour without captures.
pub const DEFAULT_BLACKOUT_MINUTE: u32 = 3;

const SECONDS_PER_HOUR: u64 = 3_600;

/// What a tick should do at a given wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Current minute is the blackout minute.
    Blackout,
    /// This wall-clock minute was already decided.
    AlreadyHandled,
    /// Run the eligibility check.
    CheckEligibility,
}

/// Timing policy of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    tick_period: Duration,
    blackout_minute: Option<u32>,
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self {
            tick_period: DEFAULT_TICK_PERIOD,
            blackout_minute: Some(DEFAULT_BLACKOUT_MINUTE),
        }
    }
}

impl ScheduleWindow {
    /// Creates a validated window.
    ///
    /// # Errors
    /// Returns [`SchedulerError::InvalidTickPeriod`] for a zero period and
    /// [`SchedulerError::InvalidBlackoutMinute`] for minutes above 59.
    pub fn new(tick_period: Duration, blackout_minute: Option<u32>) -> Result<Self, SchedulerError> {
        if tick_period.is_zero() {
            return Err(SchedulerError::InvalidTickPeriod);
        }
        if let Some(minute) = blackout_minute
            && minute > 59
        {
            return Err(SchedulerError::InvalidBlackoutMinute(minute));
        }
        Ok(Self {
            tick_period,
            blackout_minute,
        })
    }

    /// Returns the tick period.
    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    /// Returns the blackout minute, if any.
    pub fn blackout_minute(&self) -> Option<u32> {
        self.blackout_minute
    }

    /// Classifies a tick firing at `now`.
    ///
    /// `last_handled` is the start of the last minute whose eligibility was
    /// checked.
    pub fn tick(&self, now: NaiveDateTime, last_handled: Option<NaiveDateTime>) -> TickAction {
        if self.blackout_minute == Some(now.minute()) {
            return TickAction::Blackout;
        }
        if last_handled == Some(minute_start(now)) {
            return TickAction::AlreadyHandled;
        }
        TickAction::CheckEligibility
    }

    /// Returns the delay from `now` to the top of the next hour.
    ///
    /// Exactly on the hour the next boundary is a full hour away.
    pub fn resync(&self, now: NaiveDateTime) -> Duration {
        let into_hour = Duration::new(
            u64::from(now.minute()) * 60 + u64::from(now.second()),
            now.nanosecond().min(999_999_999),
        );
        Duration::from_secs(SECONDS_PER_HOUR).saturating_sub(into_hour)
    }
}

/// Truncates a timestamp to the start of its minute.
pub fn minute_start(now: NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|value| value.with_nanosecond(0))
        .unwrap_or(now)
}

/// Source of wall-clock time.
pub trait WallClock: Send + Sync {
    /// Returns local wall-clock time.
    fn now(&self) -> NaiveDateTime;
}

/// System local clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Eligibility source consulted on every non-blackout tick.
#[async_trait]
pub trait EligibilityCheck: Send + Sync {
    /// Returns the current capture decision.
    async fn check(&self) -> Result<CaptureDecision, EligibilityCheckError>;
}

/// Work triggered by a positive decision.
#[async_trait]
pub trait CaptureJob: Send + Sync {
    /// Runs one capture to completion. Failures are handled internally.
    async fn run(&self);
}

/// Payload of `GET /can-capture`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityResponse {
    /// Eligibility facts.
    pub data: EligibilityData,
}

/// Eligibility facts reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityData {
    /// Whether a timer is running.
    #[serde(rename = "isTimerActive")]
    pub is_timer_active: bool,
    /// Check-in timestamp, `null` when not checked in.
    #[serde(rename = "checkInTime", default)]
    pub check_in_time: Option<serde_json::Value>,
}

impl EligibilityData {
    /// Converts the payload into a decision.
    pub fn decision(&self) -> CaptureDecision {
        CaptureDecision {
            timer_active: self.is_timer_active,
            checked_in: self.check_in_time.is_some(),
        }
    }
}

/// Eligibility check backed by the authenticated API client.
#[derive(Debug, Clone)]
pub struct RemoteEligibility {
    client: Arc<AuthenticatedClient>,
}

impl RemoteEligibility {
    /// Creates the check.
    pub fn new(client: Arc<AuthenticatedClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EligibilityCheck for RemoteEligibility {
    async fn check(&self) -> Result<CaptureDecision, EligibilityCheckError> {
        let response = self
            .client
            .request(HttpMethod::Get, ELIGIBILITY_PATH, None, None)
            .await?;
        let payload: EligibilityResponse = response
            .json()
            .map_err(|error| EligibilityCheckError::InvalidPayload(error.to_string()))?;
        Ok(payload.data.decision())
    }
}

/// Result of one tick, reported for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Skipped: blackout minute.
    Blackout,
    /// Skipped: minute already decided.
    AlreadyHandled,
    /// Eligibility check failed; treated as negative.
    CheckFailed,
    /// Decision was negative.
    Declined(CaptureDecision),
    /// Decision was positive but capture-on-eligible is off.
    CaptureDisabled,
    /// Decision was positive but a capture is still running.
    CaptureCoalesced,
    /// A capture run was started.
    CaptureStarted,
}

/// Behavior switches of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Timing policy.
    pub window: ScheduleWindow,
    /// Whether positive decisions start a capture run.
    pub capture_on_eligible: bool,
}

struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Wall-clock aligned capture scheduler.
pub struct CaptureScheduler {
    options: SchedulerOptions,
    clock: Arc<dyn WallClock>,
    eligibility: Arc<dyn EligibilityCheck>,
    job: Arc<dyn CaptureJob>,
    in_flight: Arc<AtomicBool>,
    last_handled: Mutex<Option<NaiveDateTime>>,
}

impl CaptureScheduler {
    /// Creates a scheduler.
    pub fn new(
        options: SchedulerOptions,
        clock: Arc<dyn WallClock>,
        eligibility: Arc<dyn EligibilityCheck>,
        job: Arc<dyn CaptureJob>,
    ) -> Self {
        Self {
            options,
            clock,
            eligibility,
            job,
            in_flight: Arc::new(AtomicBool::new(false)),
            last_handled: Mutex::new(None),
        }
    }

    /// Returns `true` while a capture run is executing.
    pub fn capture_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Handles one tick.
    pub async fn on_tick(&self) -> TickOutcome {
        let now = self.clock.now();
        let last_handled = *self.last_handled.lock().unwrap_or_else(PoisonError::into_inner);

        match self.options.window.tick(now, last_handled) {
            TickAction::Blackout => {
                debug!(stage = "scheduler", action = "blackout", minute = now.minute());
                return TickOutcome::Blackout;
            }
            TickAction::AlreadyHandled => {
                debug!(stage = "scheduler", action = "minute_already_handled");
                return TickOutcome::AlreadyHandled;
            }
            TickAction::CheckEligibility => {}
        }

        *self.last_handled.lock().unwrap_or_else(PoisonError::into_inner) = Some(minute_start(now));

        let decision = match self.eligibility.check().await {
            Ok(decision) => decision,
            Err(error) => {
                warn!(stage = "scheduler", action = "eligibility_failed", %error);
                return TickOutcome::CheckFailed;
            }
        };

        if !decision.should_capture() {
            debug!(
                stage = "scheduler",
                action = "declined",
                timer_active = decision.timer_active,
                checked_in = decision.checked_in,
                "capture not eligible"
            );
            return TickOutcome::Declined(decision);
        }

        if !self.options.capture_on_eligible {
            debug!(stage = "scheduler", action = "capture_disabled");
            return TickOutcome::CaptureDisabled;
        }

        if self.in_flight.swap(true, Ordering::SeqCst) {
            info!(stage = "scheduler", action = "coalesced", "previous capture still running");
            return TickOutcome::CaptureCoalesced;
        }

        let guard = InFlightGuard(self.in_flight.clone());
        let job = self.job.clone();
        tokio::spawn(async move {
            let _guard = guard;
            job.run().await;
        });
        info!(stage = "scheduler", action = "capture_started");
        TickOutcome::CaptureStarted
    }

    /// Runs the tick and hourly resync until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let window = self.options.window;
        let mut ticker = new_ticker(window.tick_period(), window.tick_period());
        let resync = tokio::time::sleep(window.resync(self.clock.now()));
        tokio::pin!(resync);

        info!(
            stage = "scheduler",
            action = "started",
            tick_secs = window.tick_period().as_secs(),
            capture_on_eligible = self.options.capture_on_eligible,
            "capture scheduler running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(stage = "scheduler", action = "stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.on_tick().await;
                    debug!(stage = "scheduler", action = "tick", ?outcome);
                }
                () = &mut resync => {
                    ticker = new_ticker(Duration::ZERO, window.tick_period());
                    let delay = window.resync(self.clock.now());
                    resync.as_mut().reset(Instant::now() + delay);
                    info!(stage = "scheduler", action = "resynced", next_secs = delay.as_secs());
                }
            }
        }
    }
}

fn new_ticker(first_delay: Duration, period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Failure of the `/can-capture` check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EligibilityCheckError {
    /// Request failed (network, auth or status).
    #[error("eligibility request failed: {0}")]
    Http(#[from] HttpError),
    /// Response body did not match the contract.
    #[error("invalid eligibility payload: {0}")]
    InvalidPayload(String),
}

/// Scheduler configuration error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Tick period must be positive.
    #[error("tick period must be greater than zero")]
    InvalidTickPeriod,
    /// Blackout minute must be within an hour.
    #[error("blackout minute must be 0-59, got {0}")]
    InvalidBlackoutMinute(u32),
}
