//! Task queue and dispatch loop
//!
//! One long-running loop pops queued tasks, picks the next healthy pool
//! round-robin, and spawns the send without waiting for it to finish: the
//! global rate limit throttles dispatch, not completion. Quarantined
//! pools rotate to the tail and are skipped; when every pool is quarantined
//! the loop backs off for a second per cycle instead of spinning.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use transport::{AccountCredentials, Payload, Transport};

use crate::connection::RetryPolicy;
use crate::error::{Error, Result};
use crate::ids::IdGenerator;
use crate::pool::Pool;
use crate::task::{Task, TaskHandle};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Dispatch throttle in sends per minute; 0 or negative disables it.
    pub rate_limit: i64,
    /// Connections per account.
    pub pool_size: usize,
    /// Per-send retry budget and backoff growth.
    pub retry: RetryPolicy,
    /// Quarantine duration after an account-level failure.
    pub cooldown: Duration,
    /// Task queue bound; `None` keeps the queue unbounded. With a bound,
    /// submissions beyond capacity are rejected with `Error::QueueFull`.
    pub queue_capacity: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rate_limit: 60,
            pool_size: 2,
            retry: RetryPolicy::default(),
            cooldown: Duration::from_secs(3600),
            queue_capacity: None,
        }
    }
}

enum QueueTx {
    Unbounded(mpsc::UnboundedSender<Task>),
    Bounded(mpsc::Sender<Task>),
}

enum QueueRx {
    Unbounded(mpsc::UnboundedReceiver<Task>),
    Bounded(mpsc::Receiver<Task>),
}

impl QueueTx {
    fn push(&self, task: Task) -> Result<()> {
        match self {
            QueueTx::Unbounded(tx) => tx.send(task).map_err(|_| Error::Shutdown),
            QueueTx::Bounded(tx) => tx.try_send(task).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => Error::QueueFull,
                mpsc::error::TrySendError::Closed(_) => Error::Shutdown,
            }),
        }
    }
}

impl QueueRx {
    async fn recv(&mut self) -> Option<Task> {
        match self {
            QueueRx::Unbounded(rx) => rx.recv().await,
            QueueRx::Bounded(rx) => rx.recv().await,
        }
    }
}

/// The dispatch engine: a task queue, one pool per account, and the loop
/// assigning one to the other.
pub struct Scheduler {
    ids: IdGenerator,
    queue: StdMutex<Option<QueueTx>>,
    pools: Vec<Arc<Pool>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Build one pool per account and start the dispatch loop. Must be
    /// called from within a Tokio runtime.
    pub fn new(
        accounts: Vec<AccountCredentials>,
        transport: Arc<dyn Transport>,
        config: SchedulerConfig,
    ) -> Result<Arc<Self>> {
        if accounts.is_empty() {
            return Err(Error::InvalidConfig("at least one sender account is required"));
        }
        if config.pool_size == 0 {
            return Err(Error::InvalidConfig("pool_size must be at least 1"));
        }

        let pool_ids = IdGenerator::new("pool");
        let pools: Vec<Arc<Pool>> = accounts
            .into_iter()
            .map(|account| {
                Pool::new(
                    account,
                    transport.clone(),
                    config.pool_size,
                    config.retry.clone(),
                    config.cooldown,
                    &pool_ids,
                )
            })
            .collect();

        let (queue_tx, queue_rx) = match config.queue_capacity {
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
            }
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
            }
        };

        let rotation: VecDeque<Arc<Pool>> = pools.iter().cloned().collect();
        let dispatcher = tokio::spawn(dispatch_loop(queue_rx, rotation, config.rate_limit));
        info!(
            pools = pools.len(),
            rate_limit = config.rate_limit,
            "dispatch engine started"
        );

        Ok(Arc::new(Self {
            ids: IdGenerator::new("task"),
            queue: StdMutex::new(Some(queue_tx)),
            pools,
            dispatcher: StdMutex::new(Some(dispatcher)),
        }))
    }

    /// Queue a payload for delivery. Non-blocking; backpressure is the
    /// caller's concern unless a queue bound was configured.
    pub fn submit(&self, payload: Payload) -> Result<TaskHandle> {
        let id = self.ids.generate();
        let (task, handle) = Task::new(id, payload);
        let queue = self.queue.lock().expect("queue lock poisoned");
        match queue.as_ref() {
            Some(queue) => {
                queue.push(task)?;
                debug!(task = %handle.id(), "task queued");
                Ok(handle)
            }
            None => Err(Error::Shutdown),
        }
    }

    /// Pool snapshots plus a rollup: all pools available → healthy, some →
    /// degraded, none → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let statuses: Vec<_> = self.pools.iter().map(|pool| pool.status()).collect();
        let available = statuses.iter().filter(|status| status.available).count();
        let overall = if available == statuses.len() {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": overall,
            "pools_total": statuses.len(),
            "pools_available": available,
            "pools": statuses
                .iter()
                .map(|status| {
                    serde_json::json!({
                        "account": status.account,
                        "available": status.available,
                        "cooldown_remaining_secs": status.cooldown_remaining_secs,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }

    /// Stop accepting work and drain. Queued and in-flight sends get
    /// `drain_timeout` to finish; whatever is left is aborted and its
    /// callers observe `Error::Shutdown`.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        drop(self.queue.lock().expect("queue lock poisoned").take());
        let handle = self
            .dispatcher
            .lock()
            .expect("dispatcher lock poisoned")
            .take();

        let Some(mut handle) = handle else {
            return;
        };
        match tokio::time::timeout(drain_timeout, &mut handle).await {
            Ok(_) => info!("dispatch engine drained"),
            Err(_) => {
                warn!(
                    drain_timeout_secs = drain_timeout.as_secs(),
                    "drain timeout exceeded, aborting outstanding sends"
                );
                handle.abort();
            }
        }
    }
}

async fn dispatch_loop(mut queue: QueueRx, mut rotation: VecDeque<Arc<Pool>>, rate_limit: i64) {
    let delay =
        (rate_limit > 0).then(|| Duration::from_secs_f64(60.0 / rate_limit as f64));
    let mut in_flight = JoinSet::new();

    while let Some(task) = queue.recv().await {
        // Reap whatever finished since the last dispatch.
        while in_flight.try_join_next().is_some() {}

        let pool = next_healthy_pool(&mut rotation).await;
        debug!(
            task = %task.id(),
            pool = %pool.id(),
            account = %pool.account(),
            "task assigned"
        );
        in_flight.spawn(async move { pool.run_task(task).await });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    // Queue closed: wait out the in-flight sends before exiting.
    while in_flight.join_next().await.is_some() {}
    debug!("dispatch loop stopped");
}

/// Rotate until a healthy pool turns up. Pools are pushed back to the tail
/// whether or not they are picked, which is what makes assignment
/// round-robin. After one full fruitless cycle, sleep a second so an
/// all-quarantined fleet does not busy-spin.
async fn next_healthy_pool(rotation: &mut VecDeque<Arc<Pool>>) -> Arc<Pool> {
    loop {
        for _ in 0..rotation.len() {
            let pool = rotation.pop_front().expect("rotation holds at least one pool");
            rotation.push_back(pool.clone());
            if pool.is_available() {
                return pool;
            }
        }
        debug!("all pools quarantined, pausing dispatch");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
