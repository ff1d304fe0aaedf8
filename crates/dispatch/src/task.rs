//! Send task and its caller-facing completion handle

use tokio::sync::oneshot;
use tracing::debug;
use transport::{Payload, Receipt};

use crate::error::{Error, Result};

/// A single queued send request.
///
/// The result slot is a oneshot channel, so a task transitions from pending
/// to done exactly once: `complete` consumes the task, making a double
/// write unrepresentable.
pub struct Task {
    id: String,
    payload: Payload,
    reply: oneshot::Sender<Result<Receipt>>,
}

impl Task {
    /// Create a task and the handle its submitter will wait on.
    pub fn new(id: String, payload: Payload) -> (Self, TaskHandle) {
        let (reply, rx) = oneshot::channel();
        let handle = TaskHandle {
            id: id.clone(),
            reply: rx,
        };
        (Self { id, payload, reply }, handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Write the final result. The caller may have stopped waiting; that is
    /// not an error for the engine.
    pub(crate) fn complete(self, result: Result<Receipt>) {
        if self.reply.send(result).is_err() {
            debug!(task = %self.id, "result dropped, caller no longer waiting");
        }
    }
}

/// Caller-facing half of a task: resolves once the send finishes.
#[derive(Debug)]
pub struct TaskHandle {
    id: String,
    reply: oneshot::Receiver<Result<Receipt>>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the task to finish. A task dropped by engine teardown before
    /// completing resolves to `Error::Shutdown`.
    pub async fn result(self) -> Result<Receipt> {
        match self.reply.await {
            Ok(result) => result,
            Err(_) => Err(Error::Shutdown),
        }
    }
}
