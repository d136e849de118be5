//! Cooperative shutdown for the pipeline's long-running threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

/// Creates a linked trigger and token. The token is cloned into every thread.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = flume::bounded(0);
    (
        ShutdownTrigger {
            running: running.clone(),
            wake: Some(tx),
        },
        Shutdown { running, wake: rx },
    )
}

/// Held by the controller; firing it stops every linked [`Shutdown`] token.
#[derive(Debug)]
pub struct ShutdownTrigger {
    running: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
}

impl ShutdownTrigger {
    /// Clears the keep-running flag and wakes every sleeping thread.
    pub fn trigger(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Disconnecting the channel ends every pending `recv_timeout`.
        self.wake.take();
    }

    pub fn is_triggered(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownTrigger {
    fn drop(&mut self) {
        self.trigger();
    }
}

/// Keep-running flag plus an interruptible sleep
#[derive(Debug, Clone)]
pub struct Shutdown {
    running: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl Shutdown {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` unless shutdown fires first.
    ///
    /// Returns whether the caller should keep running.
    pub fn sleep(&self, duration: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_running(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// How a joined thread ended
#[derive(Debug)]
pub enum JoinOutcome<T> {
    Finished(T),
    Panicked,
    /// Still running at the deadline; the handle was dropped and the thread detached.
    TimedOut,
}

impl<T> JoinOutcome<T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, JoinOutcome::Finished(_))
    }
}

/// Joins every handle, giving all of them together at most `timeout`.
pub fn join_all<T>(
    handles: Vec<(String, JoinHandle<T>)>,
    timeout: Duration,
) -> Vec<(String, JoinOutcome<T>)> {
    let deadline = Instant::now() + timeout;
    let mut pending: Vec<Option<(String, JoinHandle<T>)>> = handles.into_iter().map(Some).collect();
    let mut outcomes: Vec<Option<(String, JoinOutcome<T>)>> = (0..pending.len()).map(|_| None).collect();

    loop {
        for (slot, outcome) in pending.iter_mut().zip(outcomes.iter_mut()) {
            let finished = slot.as_ref().is_some_and(|(_, h)| h.is_finished());
            if finished {
                if let Some((name, handle)) = slot.take() {
                    let result = match handle.join() {
                        Ok(value) => JoinOutcome::Finished(value),
                        Err(_) => {
                            warn!(thread = %name, "thread panicked");
                            JoinOutcome::Panicked
                        }
                    };
                    debug!(thread = %name, "thread joined");
                    *outcome = Some((name, result));
                }
            }
        }

        if pending.iter().all(Option::is_none) || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    for (slot, outcome) in pending.iter_mut().zip(outcomes.iter_mut()) {
        if let Some((name, _handle)) = slot.take() {
            warn!(thread = %name, ?timeout, "thread did not stop in time, detaching");
            *outcome = Some((name, JoinOutcome::TimedOut));
        }
    }

    outcomes.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_interrupts_sleep() {
        let (mut trigger, token) = shutdown_channel();
        let sleeper = thread::spawn(move || {
            let start = Instant::now();
            let kept_running = token.sleep(Duration::from_secs(10));
            (kept_running, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        trigger.trigger();
        let (kept_running, slept) = sleeper.join().unwrap();
        assert!(!kept_running);
        assert!(slept < Duration::from_secs(5));
    }

    #[test]
    fn sleep_times_out_while_running() {
        let (_trigger, token) = shutdown_channel();
        assert!(token.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn join_all_reports_stragglers() {
        let (mut trigger, token) = shutdown_channel();
        let quick = thread::spawn(|| true);
        let stuck_token = token.clone();
        let stuck = thread::spawn(move || {
            // Ignores the token for a while.
            thread::sleep(Duration::from_millis(300));
            stuck_token.is_running()
        });

        let outcomes = join_all(
            vec![("quick".into(), quick), ("stuck".into(), stuck)],
            Duration::from_millis(50),
        );
        trigger.trigger();

        assert!(matches!(outcomes[0], (ref n, JoinOutcome::Finished(true)) if n == "quick"));
        assert!(matches!(outcomes[1].1, JoinOutcome::TimedOut));
    }
}
