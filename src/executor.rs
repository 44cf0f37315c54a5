//! Background tick loop for deferred passes.
//!
//! `run_deferred` is a zero-delay deferral: the pass runs at the next
//! quiescent point rather than inside the mutation that requested it. The
//! tick loop is that quiescent point for hosts without an event loop of
//! their own: a background thread parks on a channel, wakes when a run is
//! scheduled, waits for any open batch section, and drains.
//!
//! Hosts with an event loop skip the thread entirely and call
//! [`Manager::drain`](crate::Manager::drain) from their own tick boundary.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::manager::Manager;

/// Builder for the background tick loop of one manager.
///
/// # Example
///
/// ```ignore
/// TickLoop::new()
///     .debounce(Duration::from_millis(1))
///     .spawn_fn(|f| {
///         std::thread::Builder::new()
///             .name("observant-tick".into())
///             .spawn(f)
///             .unwrap()
///     })
///     .spawn(&manager);
/// ```
#[allow(clippy::type_complexity)]
pub struct TickLoop {
    debounce: Duration,
    spawn_fn: Option<Box<dyn FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send>>,
}

impl Default for TickLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl TickLoop {
    /// Zero debounce by default: the pass runs as soon as the loop wakes.
    pub fn new() -> Self {
        Self {
            debounce: Duration::ZERO,
            spawn_fn: None,
        }
    }

    /// Collapse wake-ups arriving within `duration` into one pass.
    pub fn debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Custom thread spawning, for names, stack sizes or priorities.
    pub fn spawn_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + 'static,
    {
        self.spawn_fn = Some(Box::new(f));
        self
    }

    /// Spawn the loop and attach it to `manager`. At most one loop can be
    /// attached per manager; later attempts keep the first wake-up channel.
    pub fn spawn(self, manager: &Manager) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel::<()>();
        let _ = manager.inner.notifier.set(tx);

        let mgr = manager.clone();
        let debounce = self.debounce;
        let loop_fn: Box<dyn FnOnce() + Send> = Box::new(move || {
            tick_loop(mgr, rx, debounce);
        });

        match self.spawn_fn {
            Some(spawn_fn) => spawn_fn(loop_fn),
            None => thread::spawn(loop_fn),
        }
    }
}

fn tick_loop(mgr: Manager, rx: Receiver<()>, debounce: Duration) {
    // Parked until a run is scheduled; zero CPU while idle.
    while rx.recv().is_ok() {
        if !debounce.is_zero() {
            loop {
                match rx.recv_timeout(debounce) {
                    Ok(()) => continue,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }
        // Collapse any burst of wake-ups into this pass.
        loop {
            match rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        mgr.wait_for_sections();
        if let Err(err) = mgr.drain() {
            mgr.warn(&format!("deferred reaction pass failed: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::updatable::derivation;
    use crate::value::Record;

    fn wait_for(counter: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) < expected {
            assert!(Instant::now() < deadline, "tick loop did not drain in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn tick_loop_drains_deferred_passes() {
        let mgr = Manager::new();
        let _loop = TickLoop::new().spawn(&mgr);

        let record = Record::new();
        record.insert("a", 1);
        let obs = mgr.observe_record(&record);

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let reader = obs.clone();
        mgr.reaction(
            derivation(move |_| {
                runs_in.fetch_add(1, Ordering::Relaxed);
                reader.get("a")
            }),
            true,
        )
        .unwrap();
        wait_for(&runs, 1);

        obs.set("a", 2).unwrap();
        wait_for(&runs, 2);
    }
}
