//! Single-shot timers that post an event back to the link task.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// A delayed message delivery, cancelled when dropped.
///
/// Used for per-command deadlines and for reconnection delays. Dropping the
/// handle aborts the sleeping task, so a timer owned by a finished request
/// can never fire afterwards.
#[derive(Debug)]
pub(crate) struct ScheduledEvent {
    handle: JoinHandle<()>,
    delay: Duration,
}

impl ScheduledEvent {
    /// Deliver `event` on `tx` after `delay`.
    pub(crate) fn start<T>(delay: Duration, tx: UnboundedSender<T>, event: T) -> Self
    where
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the link task exited; nothing left to notify.
            let _ = tx.send(event);
        });
        Self { handle, delay }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledEvent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
