//! Test doubles for the dispatch engine
//!
//! `MockTransport` plays back a scripted sequence of delivery outcomes and
//! records how it was driven: connect/send counts, per-account send counts,
//! and the peak number of concurrent in-flight sends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use transport::{
    AccountCredentials, BoxFuture, Payload, Receipt, Secret, Session, Transport, TransportError,
};

/// Scripted outcome for one delivery attempt. An exhausted script keeps
/// answering `Ok`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MockOutcome {
    Ok,
    Reject(u16),
    Drop,
}

#[derive(Default)]
pub(crate) struct MockState {
    script: Mutex<VecDeque<MockOutcome>>,
    pub connects: AtomicUsize,
    pub sends: AtomicUsize,
    per_account: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    send_delay: Mutex<Option<Duration>>,
    connect_failures: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    pub state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        let mock = Self::new();
        mock.state
            .script
            .lock()
            .unwrap()
            .extend(outcomes);
        mock
    }

    pub fn arc(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Every send holds its slot for `delay` before answering; used to
    /// observe concurrency bounds.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.state.send_delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_connects(&self, n: usize) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn sent_by(&self, login: &str) -> usize {
        self.state
            .per_account
            .lock()
            .unwrap()
            .get(login)
            .copied()
            .unwrap_or(0)
    }
}

impl Transport for MockTransport {
    fn id(&self) -> &str {
        "mock"
    }

    fn connect<'a>(
        &'a self,
        credentials: &'a AccountCredentials,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>> {
        let state = self.state.clone();
        let login = credentials.login.clone();
        Box::pin(async move {
            state.connects.fetch_add(1, Ordering::SeqCst);
            let remaining = state.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                state.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TransportError::Connect("mock connect refused".into()));
            }
            Ok(Box::new(MockSession { state, login }) as Box<dyn Session>)
        })
    }
}

struct MockSession {
    state: Arc<MockState>,
    login: String,
}

impl Session for MockSession {
    fn send<'a>(
        &'a mut self,
        _payload: &'a Payload,
    ) -> BoxFuture<'a, Result<Receipt, TransportError>> {
        Box::pin(async move {
            self.state.sends.fetch_add(1, Ordering::SeqCst);
            *self
                .state
                .per_account
                .lock()
                .unwrap()
                .entry(self.login.clone())
                .or_insert(0) += 1;

            let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = *self.state.send_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

            let outcome = self
                .state
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(MockOutcome::Ok);
            match outcome {
                MockOutcome::Ok => Ok(Receipt {
                    detail: "ok".into(),
                }),
                MockOutcome::Reject(code) => Err(TransportError::Rejected {
                    code,
                    message: "mock rejection".into(),
                }),
                MockOutcome::Drop => {
                    Err(TransportError::Disconnected("mock connection dropped".into()))
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

pub(crate) fn credentials(login: &str) -> AccountCredentials {
    AccountCredentials {
        login: login.into(),
        secret: Secret::new("pw".to_string()),
    }
}

pub(crate) fn payload(body: &str) -> Payload {
    Payload {
        recipient: "ops@example.net".into(),
        subject: None,
        body: body.into(),
    }
}
