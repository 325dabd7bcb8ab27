#![warn(missing_docs)]
//! # capwatch-auth
//!
//! ## Purpose
//! Implements the authenticated HTTP client and the token refresh protocol for
//! `capwatch`.
//!
//! ## Responsibilities
//! - Attach the current bearer token to every outgoing request.
//! - Recover from a `401` by refreshing once and replaying the request once.
//! - Serialize refresh attempts so one session never has two in flight.
//! - Validate the API base URL policy (HTTPS, loopback excepted).
//!
//! ## Data flow
//! Caller -> [`AuthenticatedClient::request`] -> [`TokenStore::snapshot`]
//! headers -> [`HttpTransport::send`] -> on `401`:
//! [`AuthenticatedClient::refresh`] -> [`TokenStore::set`] -> replay.
//!
//! ## Ownership and lifetimes
//! The client is built once at startup and shared by `Arc`. Requests own
//! their bodies so a replay resends identical bytes.
//!
//! ## Error model
//! Refresh failures are [`AuthError`]; request failures are [`HttpError`].
//! A terminal rejection always clears the token store before the error is
//! returned.
//!
//! ## Security and privacy notes
//! The refresh call never carries the stale bearer header. Token values are
//! never logged, and response bodies are redacted before they reach logs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use capwatch_core::{BearerToken, HeaderList, TokenStore, redact_sensitive};
use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::{Host, Url};

/// Path of the token refresh endpoint.
pub const REFRESH_PATH: &str = "/refresh-token";

/// HTTP status that triggers the refresh protocol.
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// HTTP methods used by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_reqwest().as_str())
    }
}

/// One file part of a multipart body.
#[derive(Clone, PartialEq, Eq)]
pub struct MultipartFile {
    /// Form field name.
    pub field: String,
    /// File name reported to the server.
    pub file_name: String,
    /// MIME type of the bytes.
    pub mime: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

impl fmt::Debug for MultipartFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartFile")
            .field("field", &self.field)
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Request body variants.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    /// No body.
    #[default]
    Empty,
    /// JSON document.
    Json(serde_json::Value),
    /// Multipart form with a single file part.
    Multipart(MultipartFile),
}

/// Fully resolved request handed to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Path as requested by the caller, e.g. `/upload`.
    pub path: String,
    /// Absolute URL resolved against the API base.
    pub url: Url,
    /// Headers in dispatch order.
    pub headers: HeaderList,
    /// Body.
    pub body: RequestBody,
}

impl HttpRequest {
    /// Returns the first header value matching `name` case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Raw response returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response from status and body.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns `true` for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    /// Returns the decoder error when the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Returns the body as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Low-level transport failure (connect, timeout, body read).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        TransportError(value.to_string())
    }
}

/// Abstract transport used by the authenticated client.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends one request and returns the raw response, whatever its status.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport with the given per-request timeout.
    ///
    /// # Errors
    /// Returns [`TransportError`] when the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .http
            .request(request.method.as_reqwest(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(file) => {
                let part = multipart::Part::bytes(file.bytes.clone())
                    .file_name(file.file_name.clone())
                    .mime_str(&file.mime)?;
                builder.multipart(multipart::Form::new().part(file.field.clone(), part))
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

/// Session lifecycle as observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No token is held; a new delivery is required.
    Unauthenticated,
    /// A token is held and attached to requests.
    Authenticated,
    /// A refresh call is in flight.
    Refreshing,
}

/// Success payload of the refresh endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// Newly issued access token.
    #[serde(rename = "accessToken")]
    pub access_token: String,
}

enum Attempt {
    Complete(HttpResponse),
    Replay,
}

/// HTTP client that owns the refresh-and-retry-once policy.
pub struct AuthenticatedClient {
    base_url: Url,
    store: Arc<TokenStore>,
    transport: Arc<dyn HttpTransport>,
    refresh_guard: Mutex<()>,
    refreshing: AtomicBool,
    refresh_epoch: AtomicU64,
}

impl fmt::Debug for AuthenticatedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedClient")
            .field("base_url", &self.base_url.as_str())
            .field("state", &self.session_state())
            .finish()
    }
}

impl AuthenticatedClient {
    /// Creates a client for a validated base URL.
    ///
    /// # Errors
    /// Returns [`HttpError::InvalidUrl`] when the URL fails
    /// [`validate_base_url`].
    pub fn new(
        base_url: &str,
        store: Arc<TokenStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, HttpError> {
        let mut base_url = validate_base_url(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            store,
            transport,
            refresh_guard: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            refresh_epoch: AtomicU64::new(0),
        })
    }

    /// Returns the normalized API base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the shared token store.
    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Returns the current session state.
    pub fn session_state(&self) -> SessionState {
        if self.refreshing.load(Ordering::SeqCst) {
            SessionState::Refreshing
        } else if self.store.get().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    /// Sends a request with the current token attached.
    ///
    /// A `401` on a request that has not been retried, outside the refresh
    /// endpoint, triggers one refresh and one replay.
    ///
    /// # Errors
    /// - [`HttpError::Unauthorized`] for a refresh-endpoint `401` or a second
    ///   `401` after the replay. The token store is cleared first.
    /// - [`HttpError::Refresh`] when the refresh protocol failed.
    /// - [`HttpError::Status`] for any other non-2xx status.
    /// - [`HttpError::Transport`] for network failures.
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<RequestBody>,
        headers: Option<HeaderList>,
    ) -> Result<HttpResponse, HttpError> {
        let body = body.unwrap_or_default();
        let extra_headers = headers.unwrap_or_default();

        let mut already_retried = false;
        loop {
            match self
                .dispatch(method, path, &body, &extra_headers, already_retried)
                .await?
            {
                Attempt::Complete(response) => return Ok(response),
                Attempt::Replay => already_retried = true,
            }
        }
    }

    /// Runs the refresh protocol, waiting for any refresh already in flight.
    ///
    /// # Errors
    /// Returns [`AuthError`] on any failure; the token store is cleared.
    pub async fn refresh(&self) -> Result<BearerToken, AuthError> {
        let _guard = self.refresh_guard.lock().await;
        self.refresh_locked().await
    }

    async fn dispatch(
        &self,
        method: HttpMethod,
        path: &str,
        body: &RequestBody,
        extra_headers: &HeaderList,
        already_retried: bool,
    ) -> Result<Attempt, HttpError> {
        let epoch = self.refresh_epoch.load(Ordering::SeqCst);
        let snapshot = self.store.snapshot();
        let mut headers = snapshot.headers;
        headers.extend(extra_headers.iter().cloned());

        let request = HttpRequest {
            method,
            path: path.to_string(),
            url: self.resolve(path)?,
            headers,
            body: body.clone(),
        };

        debug!(
            stage = "http",
            action = "dispatch",
            %method,
            path,
            authenticated = snapshot.authenticated,
            already_retried,
            "sending request"
        );
        let response = self.transport.send(&request).await?;

        if response.status == STATUS_UNAUTHORIZED {
            if is_refresh_path(path) || already_retried {
                self.store.clear();
                warn!(
                    stage = "auth",
                    action = "rejected",
                    path,
                    already_retried,
                    "terminal 401; token store cleared"
                );
                return Err(HttpError::Unauthorized {
                    path: path.to_string(),
                });
            }

            self.recover_session(path, snapshot.generation, epoch).await?;
            return Ok(Attempt::Replay);
        }

        if !response.is_success() {
            return Err(HttpError::Status {
                status: response.status,
                body: redact_sensitive(&response.text()),
            });
        }

        Ok(Attempt::Complete(response))
    }

    async fn recover_session(
        &self,
        path: &str,
        observed_generation: u64,
        observed_epoch: u64,
    ) -> Result<(), HttpError> {
        let _guard = self.refresh_guard.lock().await;

        // A refresh that finished after our request left settles this 401,
        // whether it succeeded or failed.
        if self.store.generation() != observed_generation
            || self.refresh_epoch.load(Ordering::SeqCst) != observed_epoch
        {
            if self.store.get().is_some() {
                debug!(
                    stage = "auth",
                    action = "refresh_coalesced",
                    "token replaced while waiting; replaying with current token"
                );
                return Ok(());
            }
            debug!(stage = "auth", action = "session_lost", path, "store cleared while waiting");
            return Err(HttpError::Unauthorized {
                path: path.to_string(),
            });
        }

        self.refresh_locked().await?;
        Ok(())
    }

    async fn refresh_locked(&self) -> Result<BearerToken, AuthError> {
        self.refreshing.store(true, Ordering::SeqCst);
        info!(stage = "auth", action = "refresh_started");

        let outcome = self.request_new_token().await;
        match &outcome {
            Ok(token) => {
                self.store.set(token.clone());
                info!(stage = "auth", action = "refresh_succeeded");
            }
            Err(error) => {
                self.store.clear();
                warn!(
                    stage = "auth",
                    action = "refresh_failed",
                    %error,
                    "token store cleared; waiting for a new session delivery"
                );
            }
        }

        self.refresh_epoch.fetch_add(1, Ordering::SeqCst);
        self.refreshing.store(false, Ordering::SeqCst);
        outcome
    }

    async fn request_new_token(&self) -> Result<BearerToken, AuthError> {
        let url = self
            .resolve(REFRESH_PATH)
            .map_err(|error| AuthError::InvalidEndpoint(error.to_string()))?;
        let request = HttpRequest {
            method: HttpMethod::Post,
            path: REFRESH_PATH.to_string(),
            url,
            headers: self.store.headers_without_authorization(),
            body: RequestBody::Empty,
        };

        let response = self.transport.send(&request).await?;
        if !response.is_success() {
            return Err(AuthError::Rejected {
                status: response.status,
            });
        }

        let payload: RefreshResponse = response
            .json()
            .map_err(|error| AuthError::InvalidResponse(error.to_string()))?;
        BearerToken::new(payload.access_token).map_err(|error| {
            AuthError::InvalidResponse(format!("refresh payload rejected: {error}"))
        })
    }

    fn resolve(&self, path: &str) -> Result<Url, HttpError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|error| HttpError::InvalidUrl(format!("cannot resolve {path}: {error}")))
    }
}

/// Returns `true` when `path` targets the refresh endpoint.
pub fn is_refresh_path(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.trim_matches('/') == REFRESH_PATH.trim_start_matches('/')
}

/// Validates the API base URL policy.
///
/// HTTPS is required except for loopback hosts, which may use HTTP.
///
/// # Errors
/// Returns [`HttpError::InvalidUrl`] for unparseable URLs, unsupported
/// schemes, or plain HTTP to a non-loopback host.
pub fn validate_base_url(base_url: &str) -> Result<Url, HttpError> {
    let parsed = Url::parse(base_url)
        .map_err(|error| HttpError::InvalidUrl(format!("invalid base url: {error}")))?;

    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback(&parsed) => Ok(parsed),
        "http" => Err(HttpError::InvalidUrl(
            "base url must use https outside loopback".to_string(),
        )),
        other => Err(HttpError::InvalidUrl(format!(
            "unsupported base url scheme: {other}"
        ))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(address)) => address.is_loopback(),
        Some(Host::Ipv6(address)) => address.is_loopback(),
        None => false,
    }
}

/// Errors produced by the refresh protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Refresh endpoint could not be resolved.
    #[error("invalid refresh endpoint: {0}")]
    InvalidEndpoint(String),
    /// Network failure while refreshing.
    #[error("refresh transport failure: {0}")]
    Transport(#[from] TransportError),
    /// Refresh endpoint answered with a non-2xx status.
    #[error("refresh rejected with status {status}")]
    Rejected {
        /// Returned status code.
        status: u16,
    },
    /// Refresh payload was malformed or carried a blank token.
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),
}

/// Errors produced by [`AuthenticatedClient::request`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    /// URL could not be built or violates policy.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// Network failure.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// Terminal `401`; the token store has been cleared.
    #[error("unauthorized request to {path}")]
    Unauthorized {
        /// Requested path.
        path: String,
    },
    /// Refresh protocol failed; the token store has been cleared.
    #[error("session refresh failed: {0}")]
    Refresh(#[from] AuthError),
    /// Non-2xx status other than `401`.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// Returned status code.
        status: u16,
        /// Redacted response body.
        body: String,
    },
}
