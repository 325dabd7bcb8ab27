#![warn(missing_docs)]
//! # capwatch-session
//!
//! ## Purpose
//! Receives session tokens pushed by the companion login flow and hands them
//! to the shared [`TokenStore`].
//!
//! ## Responsibilities
//! - Listen on a fixed loopback port for newline-delimited JSON envelopes.
//! - Queue raw messages on a bounded channel drained by one forwarding task.
//! - Parse envelopes and store delivered tokens; ignore other message kinds.
//!
//! ## Data flow
//! Companion process -> TCP `127.0.0.1:<port>` -> per-connection line reader
//! -> bounded `mpsc` -> forwarding task -> [`SessionChannel::on_message`] ->
//! [`TokenStore::set`].
//!
//! ## Error model
//! Only binding the listener can fail. Malformed envelopes and connection
//! errors are logged and dropped; the listener keeps running.
//!
//! ## Security and privacy notes
//! The listener binds loopback only. Token values are never logged.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use capwatch_core::{BearerToken, TokenStore};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Envelope kind carrying a freshly issued token.
pub const TOKEN_DELIVERY_KIND: &str = "AUTH_TOKEN";

/// Default loopback port of the session channel.
pub const DEFAULT_SESSION_PORT: u16 = 7878;

/// Capacity of the queue between connection readers and the forwarder.
pub const CHANNEL_CAPACITY: usize = 16;

/// Longest accepted envelope line in bytes.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Wire envelope pushed by the companion process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    /// Message kind, e.g. `AUTH_TOKEN`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Token value for token deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Result of handling one raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Token was stored.
    TokenStored,
    /// Envelope kind is not a token delivery.
    Ignored {
        /// Kind that was ignored.
        kind: String,
    },
    /// Message was discarded.
    Discarded(SessionChannelError),
}

/// Parses raw messages and forwards delivered tokens to the store.
#[derive(Debug, Clone)]
pub struct SessionChannel {
    store: Arc<TokenStore>,
}

impl SessionChannel {
    /// Creates a channel writing into `store`.
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self { store }
    }

    /// Handles one raw envelope.
    ///
    /// Duplicate deliveries overwrite the stored token.
    pub fn on_message(&self, raw: &str) -> MessageOutcome {
        let envelope = match SessionEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(error) => return self.discard(error),
        };

        if !envelope.is_token_delivery() {
            debug!(stage = "session", action = "ignored", kind = %envelope.kind);
            return MessageOutcome::Ignored {
                kind: envelope.kind,
            };
        }

        match envelope.into_token() {
            Ok(token) => {
                self.store.set(token);
                info!(stage = "session", action = "token_stored", "session token delivered");
                MessageOutcome::TokenStored
            }
            Err(error) => self.discard(error),
        }
    }

    fn discard(&self, error: SessionChannelError) -> MessageOutcome {
        warn!(stage = "session", action = "discarded", %error);
        MessageOutcome::Discarded(error)
    }
}

impl SessionEnvelope {
    /// Parses one raw envelope.
    ///
    /// # Errors
    /// Returns [`SessionChannelError::Malformed`] for invalid JSON or a
    /// missing `type`.
    pub fn parse(raw: &str) -> Result<Self, SessionChannelError> {
        serde_json::from_str(raw.trim())
            .map_err(|error| SessionChannelError::Malformed(error.to_string()))
    }

    /// Returns `true` for `AUTH_TOKEN` envelopes.
    pub fn is_token_delivery(&self) -> bool {
        self.kind == TOKEN_DELIVERY_KIND
    }

    /// Extracts the delivered token.
    ///
    /// # Errors
    /// Returns [`SessionChannelError::MissingToken`] when the token is absent
    /// or blank.
    pub fn into_token(self) -> Result<BearerToken, SessionChannelError> {
        let value = self.token.ok_or(SessionChannelError::MissingToken)?;
        BearerToken::new(value).map_err(|_| SessionChannelError::MissingToken)
    }
}

/// Loopback listener feeding a [`SessionChannel`].
#[derive(Debug)]
pub struct SessionListener {
    listener: TcpListener,
}

impl SessionListener {
    /// Binds `127.0.0.1:<port>`. Port `0` picks a free port.
    ///
    /// # Errors
    /// Returns [`SessionChannelError::Bind`] when the port is unavailable.
    pub async fn bind(port: u16) -> Result<Self, SessionChannelError> {
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| SessionChannelError::Bind {
                address,
                message: source.to_string(),
            })?;
        Ok(Self { listener })
    }

    /// Returns the bound address.
    ///
    /// # Errors
    /// Propagates the socket error from the OS.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires.
    pub async fn run(self, channel: SessionChannel, cancel: CancellationToken) {
        let (sender, mut receiver) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(raw) = receiver.recv().await {
                channel.on_message(&raw);
            }
        });

        if let Ok(address) = self.listener.local_addr() {
            info!(stage = "session", action = "listening", %address);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(stage = "session", action = "stopped");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(stage = "session", action = "accepted", %peer);
                        tokio::spawn(read_connection(stream, sender.clone(), cancel.clone()));
                    }
                    Err(error) => {
                        warn!(stage = "session", action = "accept_failed", %error);
                    }
                },
            }
        }
    }
}

async fn read_connection(
    stream: TcpStream,
    sender: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_MESSAGE_BYTES));

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next() => next,
        };

        match next {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => {
                if sender.send(line).await.is_err() {
                    break;
                }
            }
            Some(Err(error)) => {
                warn!(stage = "session", action = "read_failed", %error);
                break;
            }
            None => break,
        }
    }
}

/// Session channel error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionChannelError {
    /// Listener could not bind.
    #[error("failed to bind session channel on {address}: {message}")]
    Bind {
        /// Requested address.
        address: SocketAddr,
        /// OS error text.
        message: String,
    },
    /// Envelope was not valid JSON of the expected shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// Token delivery had no usable token.
    #[error("token delivery without a token")]
    MissingToken,
}
