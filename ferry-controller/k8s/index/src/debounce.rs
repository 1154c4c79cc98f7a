//! A single-slot coalescing trigger.
//!
//! Any number of [`Trigger::trigger`] calls made while an action is pending
//! collapse into a single run. A trigger fired while the action runs is
//! honored by the next run.

use std::future::Future;
use tokio::{sync::mpsc, time};

/// Requests a run of the debounced action. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Trigger(mpsc::Sender<()>);

/// Runs an action once per burst of triggers.
#[derive(Debug)]
pub struct Debounced(mpsc::Receiver<()>);

pub fn channel() -> (Trigger, Debounced) {
    let (tx, rx) = mpsc::channel(1);
    (Trigger(tx), Debounced(rx))
}

// === impl Trigger ===

impl Trigger {
    /// Never blocks: if a run is already pending, this is a no-op.
    pub fn trigger(&self) {
        let _ = self.0.try_send(());
    }

    /// True once the debounced task has stopped.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

// === impl Debounced ===

impl Debounced {
    /// Waits `interval` after each trigger, drains whatever else arrived in the
    /// meantime and runs `action` once.
    ///
    /// Completes once every [`Trigger`] has been dropped and no run is pending.
    pub async fn run<F, Fut>(mut self, interval: time::Duration, mut action: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        while self.next(interval).await {
            action().await;
        }
        tracing::debug!("Debouncer closed");
    }

    /// Waits for the next burst of triggers to settle.
    ///
    /// Returns false once every [`Trigger`] has been dropped and no run is
    /// pending.
    pub async fn next(&mut self, interval: time::Duration) -> bool {
        if self.0.recv().await.is_none() {
            return false;
        }
        time::sleep(interval).await;
        while self.0.try_recv().is_ok() {}
        true
    }

    /// Consumes a pending trigger, if any.
    #[cfg(test)]
    pub(crate) fn take_pending(&mut self) -> bool {
        self.0.try_recv().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    const INTERVAL: time::Duration = time::Duration::from_millis(100);

    fn spawn(debounced: Debounced) -> (Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn({
            let runs = runs.clone();
            debounced.run(INTERVAL, move || {
                runs.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(())
            })
        });
        (runs, task)
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_bursts() {
        let (trigger, debounced) = channel();
        let (runs, task) = spawn(debounced);

        for _ in 0..10 {
            trigger.trigger();
        }
        time::sleep(INTERVAL * 2).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        trigger.trigger();
        time::sleep(INTERVAL / 2).await;
        trigger.trigger();
        time::sleep(INTERVAL * 2).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        drop(trigger);
        task.await.expect("debouncer must not panic");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_pending_trigger_before_closing() {
        let (trigger, debounced) = channel();
        let (runs, task) = spawn(debounced);

        trigger.trigger();
        drop(trigger);
        task.await.expect("debouncer must not panic");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_interval_after_a_trigger() {
        let (trigger, mut debounced) = channel();
        let mut next = tokio_test::task::spawn(debounced.next(INTERVAL));
        tokio_test::assert_pending!(next.poll());

        trigger.trigger();
        assert!(next.is_woken());
        tokio_test::assert_pending!(next.poll());

        time::advance(INTERVAL).await;
        tokio_test::assert_ready_eq!(next.poll(), true);
    }

    #[tokio::test]
    async fn trigger_observes_close() {
        let (trigger, debounced) = channel();
        assert!(!trigger.is_closed());
        drop(debounced);
        assert!(trigger.is_closed());
        trigger.trigger();
    }
}
