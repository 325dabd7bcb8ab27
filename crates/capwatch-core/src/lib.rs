#![warn(missing_docs)]
//! # capwatch-core
//!
//! ## Purpose
//! Defines the shared session state and data model used across the
//! `capwatch` workspace.
//!
//! ## Responsibilities
//! - Hold the single live bearer token and the request headers derived from it.
//! - Cache session cookies as one `Cookie` header value.
//! - Model capture decisions and transient capture artifacts.
//! - Scrub secrets from server-provided text before it is logged.
//!
//! ## Data flow
//! The session channel delivers a [`BearerToken`] into [`TokenStore::set`].
//! The authenticated client reads [`TokenStore::snapshot`] at dispatch time and
//! writes back refreshed tokens or clears the store on terminal rejection.
//!
//! ## Ownership and lifetimes
//! One [`TokenStore`] is constructed at startup and shared by `Arc`. Reads hand
//! out owned clones so no caller holds the store lock across a suspension
//! point.
//!
//! ## Error model
//! Blank token values are rejected with [`CoreError::BlankToken`]; every other
//! store operation is infallible.
//!
//! ## Security and privacy notes
//! [`BearerToken`] never prints its value through `Debug`. The store does not
//! log.
//!
//! ## Example
//! ```rust
//! use capwatch_core::{BearerToken, TokenStore};
//!
//! let store = TokenStore::new();
//! store.set(BearerToken::new("abc").unwrap());
//! assert_eq!(store.get().unwrap().value(), "abc");
//! store.clear();
//! assert!(store.get().is_none());
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header carrying the bearer credential.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Header carrying cached session cookies.
pub const COOKIE_HEADER: &str = "Cookie";

/// Ordered request headers as `(name, value)` pairs.
pub type HeaderList = Vec<(String, String)>;

/// Opaque bearer credential issued by the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
}

impl BearerToken {
    /// Wraps a raw token value.
    ///
    /// # Errors
    /// Returns [`CoreError::BlankToken`] when the value is empty or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(CoreError::BlankToken);
        }
        Ok(Self { value })
    }

    /// Returns the raw token value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Formats the `Authorization` header value for this token.
    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Point-in-time view of the store taken at request dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Headers to attach to the outgoing request.
    pub headers: HeaderList,
    /// Store generation at the time of the snapshot.
    pub generation: u64,
    /// Whether a bearer token was attached.
    pub authenticated: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    token: Option<BearerToken>,
    authorization: Option<String>,
    cookie: Option<String>,
    generation: u64,
}

impl StoreState {
    fn headers(&self, include_authorization: bool) -> HeaderList {
        let mut headers = Vec::with_capacity(2);
        if include_authorization && let Some(value) = &self.authorization {
            headers.push((AUTHORIZATION_HEADER.to_string(), value.clone()));
        }
        if let Some(value) = &self.cookie {
            headers.push((COOKIE_HEADER.to_string(), value.clone()));
        }
        headers
    }
}

/// Holder of the single live session token and its derived request metadata.
///
/// Token, derived headers and generation counter share one lock, so a
/// [`TokenStore::clear`] is fully visible to the next
/// [`TokenStore::snapshot`].
#[derive(Debug, Default)]
pub struct TokenStore {
    state: Mutex<StoreState>,
}

impl TokenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current token and recomputes the `Authorization` header.
    pub fn set(&self, token: BearerToken) {
        let mut state = self.lock();
        state.authorization = Some(token.authorization_value());
        state.token = Some(token);
        state.generation += 1;
    }

    /// Returns the current token, if any.
    pub fn get(&self) -> Option<BearerToken> {
        self.lock().token.clone()
    }

    /// Removes the token, its derived header and any cached cookies.
    ///
    /// Clearing an already empty store changes nothing, including the
    /// generation counter.
    pub fn clear(&self) {
        let mut state = self.lock();
        if state.token.is_none() && state.authorization.is_none() && state.cookie.is_none() {
            return;
        }
        state.token = None;
        state.authorization = None;
        state.cookie = None;
        state.generation += 1;
    }

    /// Caches session cookies as a single `k=v; k=v` header value.
    ///
    /// Pairs keep their input order. An empty iterator removes the header.
    pub fn set_cookies<I, K, V>(&self, cookies: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let joined = cookies
            .into_iter()
            .map(|(key, value)| format!("{}={}", key.as_ref(), value.as_ref()))
            .collect::<Vec<_>>()
            .join("; ");

        self.lock().cookie = if joined.is_empty() { None } else { Some(joined) };
    }

    /// Returns the headers every outgoing request should carry.
    pub fn headers(&self) -> HeaderList {
        self.lock().headers(true)
    }

    /// Returns the store headers with the bearer credential suppressed.
    pub fn headers_without_authorization(&self) -> HeaderList {
        self.lock().headers(false)
    }

    /// Returns the token generation, bumped whenever the token is set or
    /// cleared. Cookie updates leave it unchanged.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Takes a consistent snapshot of headers and generation.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.lock();
        StoreSnapshot {
            headers: state.headers(true),
            generation: state.generation,
            authenticated: state.token.is_some(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of one eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDecision {
    /// Whether the user has an active timer running.
    pub timer_active: bool,
    /// Whether the user is checked in.
    pub checked_in: bool,
}

impl CaptureDecision {
    /// Decision used when the check could not be completed.
    pub const NEGATIVE: Self = Self {
        timer_active: false,
        checked_in: false,
    };

    /// Returns `true` only when both facts hold.
    pub fn should_capture(&self) -> bool {
        self.timer_active && self.checked_in
    }
}

/// One transient capture file owned by a single pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureArtifact {
    /// Location on disk.
    pub path: PathBuf,
    /// When the capture destination was allocated.
    pub created_at: DateTime<Utc>,
}

impl CaptureArtifact {
    /// Creates an artifact record.
    pub fn new(path: impl Into<PathBuf>, created_at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            created_at,
        }
    }

    /// Returns `true` while the file is present on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Markers whose following value is treated as a secret.
const SENSITIVE_KEYS: [&str; 5] = ["password", "token", "authorization", "bearer", "cookie"];

/// Redacts values that follow common secret markers so server text is safe
/// to log.
///
/// The marker itself is kept, e.g. `{"accessToken":"<redacted>"}` or
/// `authorization=Bearer <redacted>`.
pub fn redact_sensitive(input: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;

    while let Some(key_end) = next_marker(&lower, cursor) {
        let value_start = find_value_start(&lower, key_end);
        let value_end = lower[value_start..]
            .find(|c: char| matches!(c, '"' | '\'' | ',' | ';' | '&' | '}' | ']') || c.is_whitespace())
            .map_or(lower.len(), |offset| value_start + offset);

        output.push_str(&input[cursor..value_start]);
        if value_end > value_start {
            output.push_str("<redacted>");
        }
        cursor = value_end;
    }

    output.push_str(&input[cursor..]);
    output
}

fn next_marker(lower: &str, from: usize) -> Option<usize> {
    SENSITIVE_KEYS
        .iter()
        .filter_map(|key| lower[from..].find(key).map(|offset| (from + offset, key.len())))
        .min_by_key(|(position, _)| *position)
        .map(|(position, len)| position + len)
}

/// Skips the rest of the key name, separators and a `Bearer ` scheme.
fn find_value_start(lower: &str, key_end: usize) -> usize {
    let bytes = lower.as_bytes();
    let mut index = key_end;
    while index < bytes.len() && (bytes[index].is_ascii_alphanumeric() || matches!(bytes[index], b'_' | b'-')) {
        index += 1;
    }
    while index < bytes.len() && matches!(bytes[index], b' ' | b'"' | b'\'' | b':' | b'=') {
        index += 1;
    }
    if lower[index..].starts_with("bearer ") {
        index += "bearer ".len();
    }
    index
}

/// Error type for core model validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Token value was empty or whitespace.
    #[error("bearer token must be non-empty")]
    BlankToken,
}
