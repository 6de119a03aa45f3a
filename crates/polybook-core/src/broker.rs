//! Routing of input responses to the executions waiting on them.
//!
//! Every input request a program makes is registered under its request id.
//! Responses arrive from the outside (a UI, the stdio bridge) and resolve
//! exactly one registration. A response without an id resolves the oldest
//! pending registration; with more than one prompt outstanding that may
//! answer the wrong one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

struct Pending {
    request_id: String,
    reply: oneshot::Sender<Option<String>>,
}

/// Shared table of outstanding input requests.
///
/// Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct InputBroker {
    pending: Arc<Mutex<VecDeque<Pending>>>,
}

impl InputBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request. The returned handle resolves with the response,
    /// or `None` if the request is cancelled.
    ///
    /// Dropping the handle withdraws the registration.
    pub fn register(&self, request_id: impl Into<String>) -> PendingInput {
        let request_id = request_id.into();
        let (reply, answer) = oneshot::channel();
        self.table().push_back(Pending {
            request_id: request_id.clone(),
            reply,
        });
        tracing::debug!(%request_id, "input request registered");
        PendingInput {
            request_id,
            answer,
            broker: self.clone(),
        }
    }

    /// Resolve a pending request with `value`.
    ///
    /// With `request_id` of `None`, the oldest pending request is resolved.
    /// Returns the id of the request that was resolved, if any.
    pub fn resolve(&self, request_id: Option<&str>, value: impl Into<String>) -> Option<String> {
        let entry = {
            let mut table = self.table();
            match request_id {
                Some(id) => {
                    let index = table.iter().position(|p| p.request_id == id)?;
                    table.remove(index)
                }
                None => {
                    if table.len() > 1 {
                        tracing::warn!(
                            pending = table.len(),
                            "input response without a request id; answering the oldest prompt"
                        );
                    }
                    table.pop_front()
                }
            }
        };

        let Some(entry) = entry else {
            tracing::debug!(?request_id, "no pending input request to resolve");
            return None;
        };
        tracing::debug!(request_id = %entry.request_id, "input request resolved");
        // The waiter may have given up in the meantime.
        let _ = entry.reply.send(Some(value.into()));
        Some(entry.request_id)
    }

    /// Cancel one pending request. Returns whether it was pending.
    pub fn cancel(&self, request_id: &str) -> bool {
        let entry = {
            let mut table = self.table();
            table
                .iter()
                .position(|p| p.request_id == request_id)
                .and_then(|index| table.remove(index))
        };
        match entry {
            Some(entry) => {
                let _ = entry.reply.send(None);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending request. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<Pending> = self.table().drain(..).collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), reason, "cancelling pending input requests");
        }
        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(None);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// Ids of pending requests, oldest first.
    pub fn pending_ids(&self) -> Vec<String> {
        self.table().iter().map(|p| p.request_id.clone()).collect()
    }
}

impl std::fmt::Debug for InputBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBroker")
            .field("pending", &self.pending_ids())
            .finish()
    }
}

/// A registered input request awaiting its response.
#[derive(Debug)]
pub struct PendingInput {
    request_id: String,
    answer: oneshot::Receiver<Option<String>>,
    broker: InputBroker,
}

impl PendingInput {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response. `None` means the request was cancelled.
    pub async fn wait(mut self) -> Option<String> {
        (&mut self.answer).await.ok().flatten()
    }
}

impl Drop for PendingInput {
    fn drop(&mut self) {
        self.broker.cancel(&self.request_id);
    }
}
