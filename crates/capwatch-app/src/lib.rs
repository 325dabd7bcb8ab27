#![warn(missing_docs)]
//! # capwatch-app
//!
//! ## Purpose
//! Assembles the monitored-capture agent from its subsystems and runs it.
//!
//! ## Responsibilities
//! - Parse configuration and install structured logging.
//! - Build one shared [`AuthenticatedClient`] over one [`TokenStore`].
//! - Run the loopback session listener next to the capture scheduler.
//! - Enforce the one-time consent gate and the runtime kill switch.
//!
//! ## Data flow
//! Session listener -> token store -> authenticated client -> scheduler
//! eligibility check -> kill switch -> capture pipeline upload.
//!
//! ## Error model
//! Only startup can fail ([`AppError`]). Once running, every subsystem error
//! is logged and handled locally.
//!
//! ## Security and privacy notes
//! - Capture never starts without consent and honors the kill switch.
//! - The session listener binds loopback only.
//! - Token values are never logged; see [`redact_sensitive`].

pub mod config;
pub mod logging;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use capwatch_auth::{AuthenticatedClient, HttpError, HttpTransport, ReqwestTransport, TransportError};
use capwatch_capture::{
    CaptureBackend, ConsentGate, PresetConsent, RealCaptureBackend,
    SyntheticCaptureBackend, TerminalConsent,
};
pub use capwatch_core::redact_sensitive;
use capwatch_core::TokenStore;
use capwatch_scheduler::{
    CaptureJob, CaptureScheduler, RemoteEligibility, SchedulerOptions, SystemClock, WallClock,
};
use capwatch_session::{SessionChannel, SessionChannelError, SessionListener};
use capwatch_upload::CapturePipeline;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config::{
    AgentConfig, BackendKind, ConfigError, ConsentSetting, LogFormat, LoggingConfig,
    capture_enabled_from_env,
};
pub use logging::{LoggingError, LoggingGuard, init_logging};

/// Build-time application version loaded from the root `VERSION` file.
pub const APP_VERSION: &str = env!("CAPWATCH_VERSION");

/// Returns the app version sourced from root `VERSION`.
pub fn app_version() -> &'static str {
    APP_VERSION
}

/// Predicate deciding whether capture is currently allowed.
pub type CaptureSwitch = Arc<dyn Fn() -> bool + Send + Sync>;

/// Capture job that consults the kill switch before every run.
pub struct KillSwitchJob {
    inner: Arc<dyn CaptureJob>,
    enabled: CaptureSwitch,
}

impl KillSwitchJob {
    /// Wraps `inner` behind a custom switch.
    pub fn with_switch(inner: Arc<dyn CaptureJob>, enabled: CaptureSwitch) -> Self {
        Self { inner, enabled }
    }
}

#[async_trait]
impl CaptureJob for KillSwitchJob {
    async fn run(&self) {
        if !(self.enabled)() {
            info!(stage = "capture", action = "kill_switch", "capture disabled at runtime");
            return;
        }
        self.inner.run().await;
    }
}

/// Builds the capture backend selected by configuration.
pub fn capture_backend(kind: BackendKind) -> Arc<dyn CaptureBackend> {
    match kind {
        BackendKind::Real => Arc::new(RealCaptureBackend::new()),
        BackendKind::Synthetic => Arc::new(SyntheticCaptureBackend::new()),
    }
}

/// Builds the consent gate for a configured setting.
pub fn consent_gate(setting: ConsentSetting) -> ConsentGate {
    match setting {
        ConsentSetting::Preset(granted) => ConsentGate::new(PresetConsent(granted)),
        ConsentSetting::Prompt => ConsentGate::new(TerminalConsent::default()),
    }
}

/// Runtime collaborators that tests replace.
pub struct AgentParts {
    /// HTTP transport under the authenticated client.
    pub transport: Arc<dyn HttpTransport>,
    /// Screen capture provider.
    pub backend: Arc<dyn CaptureBackend>,
    /// Wall clock driving the schedule window.
    pub clock: Arc<dyn WallClock>,
    /// One-time permission gate.
    pub consent: ConsentGate,
    /// Runtime kill switch.
    pub capture_switch: CaptureSwitch,
}

impl AgentParts {
    /// Production collaborators for `config`.
    ///
    /// # Errors
    /// Returns [`AppError::Transport`] when the HTTP client cannot be built.
    pub fn production(config: &AgentConfig) -> Result<Self, AppError> {
        Ok(Self {
            transport: Arc::new(ReqwestTransport::new(config.request_timeout)?),
            backend: capture_backend(config.backend),
            clock: Arc::new(SystemClock),
            consent: consent_gate(config.consent),
            capture_switch: Arc::new(capture_enabled_from_env),
        })
    }
}

/// Fully wired agent, ready to run.
pub struct Agent {
    store: Arc<TokenStore>,
    client: Arc<AuthenticatedClient>,
    listener: SessionListener,
    scheduler: Arc<CaptureScheduler>,
    consent: Arc<ConsentGate>,
}

impl Agent {
    /// Wires subsystems and binds the session listener.
    ///
    /// # Errors
    /// Returns [`AppError::Http`] for an unusable base URL and
    /// [`AppError::Session`] when the session port cannot be bound.
    pub async fn assemble(config: &AgentConfig, parts: AgentParts) -> Result<Self, AppError> {
        let store = Arc::new(TokenStore::new());
        let client = Arc::new(AuthenticatedClient::new(
            &config.api_base_url,
            store.clone(),
            parts.transport,
        )?);
        let listener = SessionListener::bind(config.session_port).await?;

        let pipeline = Arc::new(CapturePipeline::new(
            client.clone(),
            parts.backend,
            config.capture_dir.clone(),
        ));
        let job = Arc::new(KillSwitchJob::with_switch(pipeline, parts.capture_switch));
        let scheduler = Arc::new(CaptureScheduler::new(
            SchedulerOptions {
                window: config.window,
                capture_on_eligible: config.capture_on_eligible,
            },
            parts.clock,
            Arc::new(RemoteEligibility::new(client.clone())),
            job,
        ));

        Ok(Self {
            store,
            client,
            listener,
            scheduler,
            consent: Arc::new(parts.consent),
        })
    }

    /// Shared token store.
    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Shared authenticated client.
    pub fn client(&self) -> &Arc<AuthenticatedClient> {
        &self.client
    }

    /// Capture scheduler.
    pub fn scheduler(&self) -> &Arc<CaptureScheduler> {
        &self.scheduler
    }

    /// Bound address of the session listener.
    ///
    /// # Errors
    /// Propagates the socket error from the OS.
    pub fn session_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until `cancel` fires. The scheduler starts only after consent.
    pub async fn run(self, cancel: CancellationToken) {
        let channel = SessionChannel::new(self.store.clone());
        let listener = tokio::spawn(self.listener.run(channel, cancel.clone()));

        let granted = tokio::select! {
            _ = cancel.cancelled() => false,
            granted = ask_consent(self.consent.clone()) => granted,
        };

        if granted {
            self.scheduler.clone().run(cancel.clone()).await;
        } else {
            info!(stage = "consent", action = "scheduler_disabled", "capture permission not granted");
            cancel.cancelled().await;
        }

        if let Err(error) = listener.await {
            warn!(stage = "session", action = "listener_join_failed", %error);
        }
    }
}

async fn ask_consent(gate: Arc<ConsentGate>) -> bool {
    if let Some(granted) = gate.decision() {
        return granted;
    }
    match tokio::task::spawn_blocking(move || gate.is_granted()).await {
        Ok(granted) => granted,
        Err(error) => {
            warn!(stage = "consent", action = "prompt_task_failed", %error);
            false
        }
    }
}

/// Builds the production agent for `config` and runs it until `cancel`.
///
/// # Errors
/// Returns [`AppError`] when startup fails.
pub async fn run_agent(config: AgentConfig, cancel: CancellationToken) -> Result<(), AppError> {
    let parts = AgentParts::production(&config)?;
    let agent = Agent::assemble(&config, parts).await?;
    info!(
        stage = "agent",
        action = "started",
        version = app_version(),
        base_url = %agent.client().base_url(),
        capture_dir = %config.capture_dir.display(),
        capture_enabled = config.capture_enabled,
        capture_on_eligible = config.capture_on_eligible,
        "capwatch agent running"
    );
    agent.run(cancel).await;
    info!(stage = "agent", action = "stopped");
    Ok(())
}

/// Returns `true` when `endpoint` is acceptable as the API base URL.
pub fn is_secure_endpoint(endpoint: &str) -> bool {
    capwatch_auth::validate_base_url(endpoint).is_ok()
}

/// App integration error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration did not parse.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Logging could not be installed.
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    /// Client construction failed.
    #[error("http client error: {0}")]
    Http(#[from] HttpError),
    /// Session listener failed to start.
    #[error("session channel error: {0}")]
    Session(#[from] SessionChannelError),
    /// HTTP transport could not be built.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Runtime setup failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
