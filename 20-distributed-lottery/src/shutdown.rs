//! Cooperative cancellation shared by the server and the client.
//!
//! A single [`ShutdownTrigger`] flips a `watch` cell that any number of
//! [`Shutdown`] handles observe. Blocking points race their work against
//! the trigger and report [`Outcome::Cancelled`] instead of erroring.

use std::{future::Future, time::Duration};

use tokio::sync::watch;

/// Result of work that may be interrupted by shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(value) => Outcome::Completed(f(value)),
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Requests shutdown. Later calls have no further effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the trigger is dropped.
    pub async fn triggered(&mut self) {
        // An Err means every trigger is gone, which nobody can undo.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    /// Runs `work` unless shutdown arrives first. Shutdown wins ties.
    pub async fn run<F: Future>(&mut self, work: F) -> Outcome<F::Output> {
        if self.is_triggered() {
            return Outcome::Cancelled;
        }
        tokio::select! {
            biased;
            _ = self.triggered() => Outcome::Cancelled,
            output = work => Outcome::Completed(output),
        }
    }

    pub async fn sleep(&mut self, duration: Duration) -> Outcome<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}

/// Completes on Ctrl-C, or on SIGTERM where available.
pub async fn signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use std::future::pending;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn completed_work_is_returned() {
        let (_trigger, mut shutdown) = channel();
        assert_eq!(shutdown.run(async { 7 }).await, Outcome::Completed(7));
    }

    #[tokio::test]
    async fn trigger_interrupts_pending_work() {
        let (trigger, mut shutdown) = channel();
        let waiter = tokio::spawn(async move { shutdown.run(pending::<()>()).await });

        tokio::task::yield_now().await;
        trigger.trigger();

        let outcome = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finishes")
            .expect("task joins");
        assert!(outcome.is_cancelled());
    }

    #[tokio::test]
    async fn already_triggered_skips_work() {
        let (trigger, mut shutdown) = channel();
        trigger.trigger();
        trigger.trigger();

        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.run(async { 1 }).await, Outcome::Cancelled);
        assert!(trigger.subscribe().is_triggered());
    }

    #[tokio::test]
    async fn dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);

        let outcome = timeout(Duration::from_secs(1), shutdown.run(pending::<()>()))
            .await
            .expect("run returns");
        assert!(outcome.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_is_cancellable() {
        let (trigger, mut shutdown) = channel();
        trigger.trigger();
        let outcome = timeout(Duration::from_secs(1), shutdown.sleep(Duration::from_secs(60)))
            .await
            .expect("sleep is cut short");
        assert_eq!(outcome, Outcome::Cancelled);
    }

    #[test]
    fn map_preserves_cancellation() {
        assert_eq!(Outcome::Completed(2).map(|n| n * 2), Outcome::Completed(4));
        assert_eq!(Outcome::<i32>::Cancelled.map(|n| n * 2), Outcome::Cancelled);
    }
}
