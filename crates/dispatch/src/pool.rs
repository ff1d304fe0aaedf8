//! Connection pool and health state machine for one sender account
//!
//! The pool holds a fixed set of connections in a free queue; `checkout`
//! suspends until one is available and the returned guard checks it back in
//! on drop, so a connection is released on every exit path.
//!
//! Health events flow from connections over a channel to the pool's own
//! state task, which is the only writer of availability state. State machine:
//! healthy → quarantined on a `Throttled` or `Degraded` event, quarantined →
//! healthy on a `Success` event or cooldown expiry. A new failure event
//! re-arms the cooldown, replacing any deadline already running.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use transport::{AccountCredentials, Transport};

use crate::connection::{Connection, RetryPolicy};
use crate::ids::IdGenerator;
use crate::task::Task;

/// Health signal from a connection to its owning pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Success,
    Throttled,
    Degraded,
}

/// Snapshot of one pool for health reporting.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub account: String,
    pub available: bool,
    pub cooldown_remaining_secs: Option<u64>,
}

/// Bounded set of reusable connections dedicated to one account.
pub struct Pool {
    id: String,
    account: String,
    size: usize,
    policy: RetryPolicy,
    free_tx: mpsc::Sender<Connection>,
    free_rx: Mutex<mpsc::Receiver<Connection>>,
    events: mpsc::UnboundedSender<HealthEvent>,
    available: Arc<AtomicBool>,
    quarantined_until: Arc<StdMutex<Option<Instant>>>,
}

impl Pool {
    /// Build a pool of `size` connections for one account and start its
    /// health task. Must be called from within a Tokio runtime.
    pub fn new(
        credentials: AccountCredentials,
        transport: Arc<dyn Transport>,
        size: usize,
        policy: RetryPolicy,
        cooldown: Duration,
        ids: &IdGenerator,
    ) -> Arc<Self> {
        let id = ids.generate();
        let account = credentials.login.clone();
        let size = size.max(1);

        let (free_tx, free_rx) = mpsc::channel(size);
        for i in 0..size {
            let conn = Connection::new(
                format!("{id}-c{i}"),
                credentials.clone(),
                transport.clone(),
            );
            free_tx
                .try_send(conn)
                .expect("free queue is sized to hold every connection");
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let available = Arc::new(AtomicBool::new(true));
        let quarantined_until = Arc::new(StdMutex::new(None));
        tokio::spawn(health_loop(
            account.clone(),
            events_rx,
            available.clone(),
            quarantined_until.clone(),
            cooldown,
        ));

        info!(pool = %id, account = %account, size, "pool initialized");
        Arc::new(Self {
            id,
            account,
            size,
            policy,
            free_tx,
            free_rx: Mutex::new(free_rx),
            events,
            available,
            quarantined_until,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Check a free connection out, suspending until one is available. The
    /// guard checks it back in when dropped.
    pub async fn checkout(&self) -> PooledConnection {
        let mut free = self.free_rx.lock().await;
        let conn = free
            .recv()
            .await
            .expect("pool owns a sender, free queue cannot close");
        PooledConnection {
            conn: Some(conn),
            free: self.free_tx.clone(),
        }
    }

    /// Process one task end to end: checkout, send with retry, complete.
    pub async fn run_task(&self, task: Task) {
        let start = Instant::now();
        let mut conn = self.checkout().await;
        let result = conn
            .send_task(task.payload(), &self.policy, &self.events)
            .await;

        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics::histogram!("dispatch_send_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        metrics::counter!("dispatch_tasks_total", "outcome" => outcome).increment(1);
        task.complete(result);
    }

    /// Snapshot for the health endpoint.
    pub fn status(&self) -> PoolStatus {
        let cooldown_remaining_secs = self
            .quarantined_until
            .lock()
            .expect("quarantine slot lock poisoned")
            .map(|until| until.saturating_duration_since(Instant::now()).as_secs());
        PoolStatus {
            account: self.account.clone(),
            available: self.is_available(),
            cooldown_remaining_secs,
        }
    }
}

/// RAII guard over a checked-out connection.
pub struct PooledConnection {
    conn: Option<Connection>,
    free: mpsc::Sender<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Capacity equals pool size, so this only fails when the pool
            // itself is being torn down; the connection goes down with it.
            if self.free.try_send(conn).is_err() {
                debug!("pool torn down before checkin");
            }
        }
    }
}

/// Owns availability state for one pool. Exits when the pool (the only
/// event sender) is dropped.
async fn health_loop(
    account: String,
    mut events: mpsc::UnboundedReceiver<HealthEvent>,
    available: Arc<AtomicBool>,
    quarantined_until: Arc<StdMutex<Option<Instant>>>,
    cooldown: Duration,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    None => break,
                    Some(HealthEvent::Success) => {
                        if !available.swap(true, Ordering::SeqCst) {
                            info!(account = %account, "send succeeded, pool recovered");
                            metrics::counter!("dispatch_pool_transitions_total", "state" => "recovered")
                                .increment(1);
                        }
                        deadline = None;
                    }
                    Some(event @ (HealthEvent::Throttled | HealthEvent::Degraded)) => {
                        deadline = Some(Instant::now() + cooldown);
                        if available.swap(false, Ordering::SeqCst) {
                            warn!(
                                account = %account,
                                ?event,
                                cooldown_secs = cooldown.as_secs(),
                                "pool quarantined"
                            );
                            metrics::counter!("dispatch_pool_transitions_total", "state" => "quarantined")
                                .increment(1);
                        } else {
                            debug!(account = %account, ?event, "quarantine extended");
                        }
                    }
                }
            }
            _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                available.store(true, Ordering::SeqCst);
                deadline = None;
                info!(account = %account, "cooldown expired, pool available again");
                metrics::counter!("dispatch_pool_transitions_total", "state" => "recovered")
                    .increment(1);
            }
        }
        *quarantined_until
            .lock()
            .expect("quarantine slot lock poisoned") = deadline;
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockOutcome, MockTransport, credentials, payload};
    use std::sync::atomic::Ordering as AtomicOrdering;

    const COOLDOWN: Duration = Duration::from_secs(3600);

    fn pool_with(mock: &MockTransport, size: usize, policy: RetryPolicy) -> Arc<Pool> {
        Pool::new(
            credentials("sender-a"),
            mock.arc(),
            size,
            policy,
            COOLDOWN,
            &IdGenerator::new("pool"),
        )
    }

    /// Give the health task a chance to drain its event queue.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn run_one(pool: &Arc<Pool>, body: &str) -> crate::Result<transport::Receipt> {
        let (task, handle) = Task::new("task-t".into(), payload(body));
        pool.run_task(task).await;
        handle.result().await
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_never_exceed_pool_size() {
        let mock = MockTransport::new();
        mock.set_send_delay(Duration::from_millis(50));
        let pool = pool_with(&mock, 2, RetryPolicy::default());

        let mut handles = Vec::new();
        let mut joins = Vec::new();
        for i in 0..5 {
            let (task, handle) = Task::new(format!("task-{i}"), payload("hello"));
            let pool = pool.clone();
            joins.push(tokio::spawn(async move { pool.run_task(task).await }));
            handles.push(handle);
        }
        for join in joins {
            join.await.unwrap();
        }
        for handle in handles {
            handle.result().await.unwrap();
        }

        let max = mock.state.max_in_flight.load(AtomicOrdering::SeqCst);
        assert!(max <= 2, "checked out {max} connections from a pool of 2");
        assert_eq!(mock.state.sends.load(AtomicOrdering::SeqCst), 5);
    }

    #[tokio::test]
    async fn checkout_guard_returns_connection_on_drop() {
        let mock = MockTransport::new();
        let pool = pool_with(&mock, 1, RetryPolicy::default());

        let guard = pool.checkout().await;
        assert_eq!(guard.id(), format!("{}-c0", pool.id()));
        drop(guard);

        // The single connection must be back in the free queue.
        let guard = pool.checkout().await;
        assert!(!guard.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_send_quarantines_pool() {
        let mock = MockTransport::with_script([MockOutcome::Reject(550)]);
        let pool = pool_with(&mock, 1, RetryPolicy::default());
        assert!(pool.is_available());

        let err = run_one(&pool, "hello").await.unwrap_err();
        assert_eq!(err.code(), Some(550));
        settle().await;

        assert!(!pool.is_available());
        let status = pool.status();
        assert!(!status.available);
        assert!(status.cooldown_remaining_secs.unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_recovers_quarantined_pool() {
        let mock = MockTransport::with_script([MockOutcome::Reject(550), MockOutcome::Ok]);
        let pool = pool_with(&mock, 1, RetryPolicy::default());

        run_one(&pool, "fails").await.unwrap_err();
        settle().await;
        assert!(!pool.is_available());

        run_one(&pool, "recovers").await.unwrap();
        settle().await;
        assert!(pool.is_available());
        assert!(pool.status().cooldown_remaining_secs.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expiry_recovers_pool() {
        let mock = MockTransport::with_script([MockOutcome::Reject(550)]);
        let pool = pool_with(&mock, 1, RetryPolicy::default());

        run_one(&pool, "fails").await.unwrap_err();
        settle().await;
        assert!(!pool.is_available());

        tokio::time::advance(COOLDOWN + Duration::from_secs(1)).await;
        settle().await;
        assert!(pool.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn requarantine_resets_the_cooldown_clock() {
        let mock =
            MockTransport::with_script([MockOutcome::Reject(550), MockOutcome::Reject(550)]);
        let pool = pool_with(&mock, 1, RetryPolicy::default());

        run_one(&pool, "first failure").await.unwrap_err();
        settle().await;

        // Halfway through the cooldown a second failure arrives.
        tokio::time::advance(COOLDOWN / 2).await;
        run_one(&pool, "second failure").await.unwrap_err();
        settle().await;

        // The original deadline has passed, but the replacement has not.
        tokio::time::advance(COOLDOWN / 2 + Duration::from_secs(1)).await;
        settle().await;
        assert!(!pool.is_available(), "old deadline must have been replaced");

        tokio::time::advance(COOLDOWN / 2).await;
        settle().await;
        assert!(pool.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_exhaustion_quarantines_pool() {
        let mock = MockTransport::with_script([MockOutcome::Reject(421)]);
        let policy = RetryPolicy {
            retries: 0,
            ..RetryPolicy::default()
        };
        let pool = pool_with(&mock, 1, policy);

        let err = run_one(&pool, "hello").await.unwrap_err();
        assert!(matches!(err, crate::Error::RetriesExhausted { .. }));
        settle().await;
        assert!(!pool.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn in_budget_throttle_does_not_quarantine() {
        // 421 twice then success: the pool must never go unavailable.
        let mock = MockTransport::with_script([
            MockOutcome::Reject(421),
            MockOutcome::Reject(421),
            MockOutcome::Ok,
        ]);
        let pool = pool_with(&mock, 1, RetryPolicy::default());

        let receipt = run_one(&pool, "hello").await.unwrap();
        assert_eq!(receipt.detail, "ok");
        settle().await;
        assert!(pool.is_available());
    }

    #[tokio::test]
    async fn status_reports_account_and_availability() {
        let mock = MockTransport::new();
        let pool = pool_with(&mock, 2, RetryPolicy::default());

        let status = pool.status();
        assert_eq!(status.account, "sender-a");
        assert!(status.available);
        assert!(status.cooldown_remaining_secs.is_none());
        assert_eq!(pool.size(), 2);
    }
}
