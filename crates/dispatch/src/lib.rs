//! Outbound send-task dispatch engine
//!
//! Fans message-send work across multiple sender accounts, each backed by a
//! bounded pool of live connections, while throttling overall dispatch rate
//! and quarantining accounts that start failing.
//!
//! Task lifecycle:
//! 1. Caller submits a payload → `Scheduler::submit` queues a `Task` and
//!    returns a `TaskHandle`
//! 2. The dispatch loop pops the task and the next healthy `Pool`
//!    (round-robin), then hands the task to the pool without waiting on it
//! 3. The pool checks a `Connection` out of its free set; the connection
//!    sends, reconnecting and backing off per its retry policy
//! 4. The result (receipt or terminal error) is written into the task; the
//!    caller observes it through the handle
//! 5. The connection reports the outcome to its pool, which may quarantine
//!    the account until a success or a cooldown expiry
//!
//! Quarantined pools are skipped by the dispatch loop until they self-heal.

pub mod connection;
pub mod error;
pub mod ids;
pub mod pool;
pub mod scheduler;
pub mod task;

pub use connection::{Connection, RetryPolicy};
pub use error::{Error, Result};
pub use ids::IdGenerator;
pub use pool::{HealthEvent, Pool, PoolStatus, PooledConnection};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use task::{Task, TaskHandle};

#[cfg(test)]
pub(crate) mod testutil;
