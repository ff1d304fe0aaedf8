//! Transport abstraction for outbound message delivery
//!
//! Defines the `Transport` and `Session` traits that decouple the dispatch
//! engine from any concrete wire protocol. The engine only needs three things
//! from a transport: an authenticated session per account, a way to push one
//! payload through that session, and a numeric reply code on rejection. The
//! reply code is the sole signal used to classify how the engine should react
//! (back off, quarantine the account, or give up on the message).
//!
//! `HttpTransport` is the shipped implementation; everything above it is
//! protocol-agnostic.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

pub use common::Secret;
pub use http::HttpTransport;

/// Boxed future used by the dyn-compatible transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Login name plus secret for one sender account.
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub login: String,
    pub secret: Secret<String>,
}

/// One outbound message. The engine treats it as opaque cargo; only the
/// transport interprets the fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

/// Remote acknowledgement for a delivered payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub detail: String,
}

/// Errors from transport operations.
///
/// `Rejected` carries the remote reply code; `Connect` and `Disconnected`
/// describe session-level failures that the engine recovers from by
/// reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("session dropped: {0}")]
    Disconnected(String),

    #[error("rejected with code {code}: {message}")]
    Rejected { code: u16, message: String },
}

impl TransportError {
    /// Remote reply code, if this error carries one.
    pub fn code(&self) -> Option<u16> {
        match self {
            TransportError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Classification of a rejected send, derived from the reply code.
///
/// - `Throttled`: the remote asked us to slow down; retry the same
///   connection after a backoff.
/// - `Degraded`: the remote is refusing the sender account itself; terminal
///   for the message, and the owning pool should quarantine.
/// - `Rejected`: the message was permanently refused; never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Throttled,
    Degraded,
    Rejected,
}

/// Classify a remote reply code.
///
/// 421/429 and the 450 range are "slow down" replies. 535/550/551 indicate
/// the account is being refused (bad auth standing, sender blocked, policy
/// rejection of the sender). Everything else is treated as a permanent
/// rejection of the message; retrying an unknown code risks hammering a
/// remote that has already said no.
pub fn classify_code(code: u16) -> ErrorClass {
    match code {
        421 | 429 | 450..=452 => ErrorClass::Throttled,
        535 | 550 | 551 => ErrorClass::Degraded,
        _ => ErrorClass::Rejected,
    }
}

/// An authenticated session over some wire protocol.
///
/// Sends on one session are strictly sequential; the engine enforces this by
/// checking a session's owning connection out of its pool for the duration
/// of a send.
pub trait Session: Send {
    /// Deliver one payload. A `Disconnected` error means the session is dead
    /// and must be replaced before the next attempt.
    fn send<'a>(&'a mut self, payload: &'a Payload)
    -> BoxFuture<'a, Result<Receipt, TransportError>>;

    /// Tear the session down. Advisory; dropping a session must also be safe.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

impl std::fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Session")
    }
}

/// A wire protocol capable of delivering payloads for an authenticated
/// account.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Transport>` is shared across every pool).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "http").
    fn id(&self) -> &str;

    /// Establish an authenticated session for `credentials`.
    fn connect<'a>(
        &'a self,
        credentials: &'a AccountCredentials,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>>;
}
