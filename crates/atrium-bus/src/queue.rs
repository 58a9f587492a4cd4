//! Closeable handoff queue between a bus handler and an exchange consumer.
//!
//! The handler pushes from synchronous dispatch; the consumer pops from an
//! async context. Items pushed before the consumer starts pulling simply
//! wait in the queue — registration order between producer and consumer
//! does not matter. Aborting the shared [`AbortSignal`] discards further
//! pushes and wakes a parked `pop` immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use atrium_protocol::DriveableEvent;
use tokio::sync::{Notify, mpsc};
use tracing::trace;

/// Shared abort flag that also wakes a receiver parked in [`QueueReceiver::pop`].
#[derive(Default)]
pub struct AbortSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake the receiver. Returns whether the signal was
    /// already aborted.
    pub fn abort(&self) -> bool {
        let was_aborted = self.flag.swap(true, Ordering::SeqCst);
        if !was_aborted {
            self.notify.notify_one();
        }
        was_aborted
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn aborted(&self) {
        self.notify.notified().await;
    }
}

pub fn event_queue(signal: Arc<AbortSignal>) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        QueueSender {
            tx,
            signal: Arc::clone(&signal),
        },
        QueueReceiver { rx, signal },
    )
}

#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<DriveableEvent>,
    signal: Arc<AbortSignal>,
}

impl QueueSender {
    pub fn push(&self, event: DriveableEvent) {
        if self.signal.is_aborted() {
            trace!("exchange aborted; discarding queued event");
            return;
        }
        // A dropped receiver means the consumer already finished; the event
        // is simply discarded, which matches post-terminal semantics.
        let _ = self.tx.send(event);
    }
}

pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<DriveableEvent>,
    signal: Arc<AbortSignal>,
}

impl QueueReceiver {
    /// Next queued event, or `None` once the queue is closed or aborted.
    /// An abort arriving mid-wait wakes the call immediately.
    pub async fn pop(&mut self) -> Option<DriveableEvent> {
        if self.signal.is_aborted() {
            self.rx.close();
            return None;
        }
        tokio::select! {
            _ = self.signal.aborted() => {
                self.rx.close();
                None
            }
            event = self.rx.recv() => {
                if self.signal.is_aborted() {
                    self.rx.close();
                    return None;
                }
                event
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn events_pushed_before_pop_are_buffered() {
        let (tx, mut rx) = event_queue(Arc::new(AbortSignal::new()));

        tx.push(DriveableEvent::MessageStart);
        tx.push(DriveableEvent::TextDelta {
            delta: "hi".into(),
        });

        assert_eq!(rx.pop().await, Some(DriveableEvent::MessageStart));
        assert_eq!(
            rx.pop().await,
            Some(DriveableEvent::TextDelta { delta: "hi".into() })
        );
    }

    #[tokio::test]
    async fn abort_discards_pending_and_closes() {
        let signal = Arc::new(AbortSignal::new());
        let (tx, mut rx) = event_queue(Arc::clone(&signal));

        tx.push(DriveableEvent::MessageStart);
        signal.abort();
        tx.push(DriveableEvent::MessageStop);

        assert_eq!(rx.pop().await, None);
        assert!(rx.is_aborted());
    }

    #[tokio::test]
    async fn abort_wakes_a_parked_pop() {
        let signal = Arc::new(AbortSignal::new());
        let (_tx, mut rx) = event_queue(Arc::clone(&signal));

        let aborter = Arc::clone(&signal);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            aborter.abort();
        });

        // Nothing is ever pushed; the pop must still return promptly.
        let popped = tokio::time::timeout(Duration::from_millis(500), rx.pop())
            .await
            .expect("pop did not wake on abort");
        assert_eq!(popped, None);
    }

    #[test]
    fn abort_reports_prior_state() {
        let signal = AbortSignal::new();
        assert!(!signal.abort());
        assert!(signal.abort());
        assert!(signal.is_aborted());
    }
}
