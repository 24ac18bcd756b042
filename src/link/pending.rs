//! In-flight command bookkeeping.
//!
//! The table maps a correlation id to the caller waiting on it. Every entry
//! leaves the table exactly once: through a matching reply, its deadline, or
//! a forced failure when the connection goes away. Removing an entry drops
//! its deadline timer, which cancels it.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use super::error::LinkError;
use super::timer::ScheduledEvent;

/// Channel the waiting caller receives its outcome on.
pub(crate) type ReplySender = oneshot::Sender<Result<Value, LinkError>>;

/// One outstanding command.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    kind: String,
    reply: ReplySender,
    deadline: ScheduledEvent,
}

impl PendingRequest {
    pub(crate) fn new(kind: String, reply: ReplySender, deadline: ScheduledEvent) -> Self {
        Self {
            kind,
            reply,
            deadline,
        }
    }

    /// Deliver the outcome and cancel the deadline.
    fn complete(self, outcome: Result<Value, LinkError>) {
        let PendingRequest {
            kind: _,
            reply,
            deadline,
        } = self;
        deadline.cancel();
        // The caller may have stopped waiting; nothing to do then.
        let _ = reply.send(outcome);
    }
}

/// Correlation id → outstanding command.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Register a command. Ids are unique per link, so an existing entry
    /// under the same id indicates a bug; it is failed rather than leaked.
    pub(crate) fn insert(&mut self, id: String, request: PendingRequest) {
        if let Some(previous) = self.entries.insert(id.clone(), request) {
            tracing::error!("Duplicate command id {}; failing the older request", id);
            previous.complete(Err(LinkError::ConnectionClosed));
        }
    }

    /// Resolve a command from its reply. Returns `false` when no command is
    /// waiting under `id` (already timed out, or never sent from here).
    pub(crate) fn resolve(&mut self, id: &str, outcome: Result<Value, LinkError>) -> bool {
        match self.entries.remove(id) {
            Some(request) => {
                request.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail a command whose deadline elapsed. Returns `false` if it had
    /// already completed.
    pub(crate) fn expire(&mut self, id: &str, after: Duration) -> bool {
        match self.entries.remove(id) {
            Some(request) => {
                let kind = request.kind.clone();
                request.complete(Err(LinkError::CommandTimeout { kind, after }));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding command with `error` and empty the table.
    /// Returns how many were failed.
    pub(crate) fn fail_all(&mut self, error: LinkError) -> usize {
        let count = self.entries.len();
        for (_, request) in self.entries.drain() {
            request.complete(Err(error.clone()));
        }
        count
    }
}
