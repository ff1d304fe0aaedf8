//! One authenticated transport session with lazy reconnect and send retry
//!
//! A connection owns at most one live session. The session is established on
//! first use and re-established after a disconnect; a send retries in place
//! per its `RetryPolicy` and reports the final outcome to the owning pool's
//! health channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use transport::{
    AccountCredentials, ErrorClass, Payload, Receipt, Session, Transport, TransportError,
    classify_code,
};

use crate::error::{Error, Result};
use crate::pool::HealthEvent;

/// Retry budget and backoff growth for one send.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed per send before the failure is surfaced as terminal.
    pub retries: u32,
    /// Sleep after the first throttled reply.
    pub backoff: Duration,
    /// Ceiling the doubling backoff never exceeds.
    pub backoff_limit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            backoff: Duration::from_secs(30),
            backoff_limit: Duration::from_secs(600),
        }
    }
}

/// How a failed attempt is handled locally.
enum RetryClass {
    /// Session-level failure: reconnect and retry, no sleep.
    Reconnect,
    /// Remote asked us to slow down: sleep, then retry.
    Backoff,
    /// Not retryable; carries the caller-facing classification.
    Terminal(ErrorClass),
}

fn retry_class(err: &TransportError) -> RetryClass {
    match err {
        TransportError::Connect(_) | TransportError::Disconnected(_) => RetryClass::Reconnect,
        TransportError::Rejected { code, .. } => match classify_code(*code) {
            ErrorClass::Throttled => RetryClass::Backoff,
            class => RetryClass::Terminal(class),
        },
    }
}

/// One slot in a pool: a transport session plus reconnect state.
pub struct Connection {
    id: String,
    credentials: AccountCredentials,
    transport: Arc<dyn Transport>,
    session: Option<Box<dyn Session>>,
}

impl Connection {
    pub(crate) fn new(
        id: String,
        credentials: AccountCredentials,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id,
            credentials,
            transport,
            session: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected(&self) -> bool {
        self.session.is_some()
    }

    /// One delivery attempt: establish the session if needed, then send.
    /// A session that reports itself dropped is discarded so the next
    /// attempt reconnects.
    async fn attempt(&mut self, payload: &Payload) -> std::result::Result<Receipt, TransportError> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                let session = self.transport.connect(&self.credentials).await?;
                debug!(
                    connection = %self.id,
                    account = %self.credentials.login,
                    "session established"
                );
                session
            }
        };

        let result = session.send(payload).await;
        match &result {
            Err(TransportError::Disconnected(_)) => {
                // Dead session; tear it down so the next attempt reconnects.
                session.close().await;
            }
            _ => self.session = Some(session),
        }
        result
    }

    /// Send one payload, retrying per `policy`, and report the outcome on the
    /// owning pool's health channel.
    ///
    /// Session drops and connect failures consume one retry unit each and
    /// reconnect immediately. Throttled replies consume one unit and sleep
    /// `backoff`, doubling it up to `backoff_limit`. Account-degraded and
    /// permanently-rejected replies are terminal. An exhausted budget is
    /// terminal and reported as a throttle so the pool can quarantine.
    pub(crate) async fn send_task(
        &mut self,
        payload: &Payload,
        policy: &RetryPolicy,
        events: &mpsc::UnboundedSender<HealthEvent>,
    ) -> Result<Receipt> {
        let mut retries_used: u32 = 0;
        let mut backoff = policy.backoff;

        loop {
            let err = match self.attempt(payload).await {
                Ok(receipt) => {
                    let _ = events.send(HealthEvent::Success);
                    debug!(connection = %self.id, "send accepted");
                    return Ok(receipt);
                }
                Err(err) => err,
            };

            match retry_class(&err) {
                RetryClass::Reconnect => {
                    if retries_used >= policy.retries {
                        warn!(
                            connection = %self.id,
                            error = %err,
                            attempts = retries_used + 1,
                            "retry budget exhausted while reconnecting"
                        );
                        let _ = events.send(HealthEvent::Throttled);
                        return Err(Error::RetriesExhausted {
                            attempts: retries_used + 1,
                            source: err,
                        });
                    }
                    retries_used += 1;
                    metrics::counter!("dispatch_retries_total", "class" => "reconnect")
                        .increment(1);
                    warn!(connection = %self.id, error = %err, "session dropped, reconnecting");
                }
                RetryClass::Backoff => {
                    if retries_used >= policy.retries {
                        warn!(
                            connection = %self.id,
                            error = %err,
                            attempts = retries_used + 1,
                            "retry budget exhausted while throttled"
                        );
                        let _ = events.send(HealthEvent::Throttled);
                        return Err(Error::RetriesExhausted {
                            attempts: retries_used + 1,
                            source: err,
                        });
                    }
                    retries_used += 1;
                    metrics::counter!("dispatch_retries_total", "class" => "throttled")
                        .increment(1);
                    warn!(
                        connection = %self.id,
                        error = %err,
                        backoff_secs = backoff.as_secs(),
                        "throttled, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(policy.backoff_limit);
                }
                RetryClass::Terminal(class) => {
                    if class == ErrorClass::Degraded {
                        let _ = events.send(HealthEvent::Degraded);
                    }
                    warn!(connection = %self.id, error = %err, ?class, "terminal send failure");
                    return Err(Error::SendRejected { class, source: err });
                }
            }
        }
    }
}
