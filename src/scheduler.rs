//! Reaction scheduling.
//!
//! Mutations enqueue invalidated reactions; a pass (`run`) drains the
//! pending set to a fixed point, bounded so a self-invalidating reaction
//! cannot spin forever. Batch sections (`run_with`, `run_deferred_with`)
//! suppress nested scheduling for the writes they contain, and a semaphore
//! barrier keeps the tick loop from draining mid-section.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::arena::UpdatableId;
use crate::error::RunError;
use crate::manager::Manager;
use crate::updatable::{Updatable, UpdatableOptions, UserFn};

/// Bound of the fixed-point loop in `run`.
pub const MAX_ITERATIONS: usize = 10;

/// RAII batch section. While at least one section is open, writes invalidate
/// without triggering a nested reaction pass, and the barrier permit is held
/// so an attached tick loop stays parked.
struct BatchSection<'a> {
    mgr: &'a Manager,
}

impl<'a> BatchSection<'a> {
    fn enter(mgr: &'a Manager) -> Self {
        if mgr.inner.section_depth.fetch_add(1, Ordering::AcqRel) == 0 {
            // Outermost section: park the tick loop. If the permit is
            // unavailable the loop is already draining; proceeding is fine,
            // the section flag alone suppresses nested passes.
            if let Ok(permit) = mgr.inner.barrier.clone().try_acquire_owned() {
                *mgr.inner.held_permit.lock() = Some(permit);
            }
        }
        Self { mgr }
    }
}

impl Drop for BatchSection<'_> {
    fn drop(&mut self) {
        if self.mgr.inner.section_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.mgr.inner.held_permit.lock() = None;
        }
    }
}

impl Manager {
    /// Register `f` as a reaction: an updatable whose invalidation enqueues
    /// it for the next pass. The reaction is enqueued immediately; with
    /// `run_now` the pass is triggered as well (synchronously under
    /// `immediate_reaction`, else deferred).
    pub fn reaction(&self, f: impl Into<UserFn>, run_now: bool) -> Result<Updatable, RunError> {
        let updatable = self.updatable(f, UpdatableOptions::default());
        let id = updatable.id;
        let weak = self.downgrade();
        self.inner.arena.with(id, |m| {
            *m.on_invalidate.lock() = Some(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.pending.lock().insert(id);
                }
            }));
        });
        self.inner.pending.lock().insert(id);

        if run_now {
            if self.options().immediate_reaction {
                self.run()?;
            } else {
                self.run_deferred();
            }
        }
        Ok(updatable)
    }

    /// Drain pending reactions to a fixed point.
    pub fn run(&self) -> Result<(), RunError> {
        self.run_inner(None::<fn()>)
    }

    /// Open a batch section, execute `batch` (its writes invalidate without
    /// scheduling), then drain pending reactions to a fixed point.
    pub fn run_with<F: FnOnce()>(&self, batch: F) -> Result<(), RunError> {
        self.run_inner(Some(batch))
    }

    fn run_inner<F: FnOnce()>(&self, batch: Option<F>) -> Result<(), RunError> {
        if !self.options().enabled {
            return Ok(());
        }
        self.inner.scheduled.store(false, Ordering::Release);
        let _section = BatchSection::enter(self);
        if let Some(batch) = batch {
            batch();
        }

        for _ in 0..MAX_ITERATIONS {
            self.inner.valid.store(true, Ordering::Release);
            let pass: Vec<UpdatableId> = self.inner.pending.lock().drain(..).collect();
            for id in pass {
                self.invoke(id);
            }
            // A pass invocation that invalidated anything cleared the flag;
            // iterate until it survives a whole drain.
            let settled = self.inner.valid.load(Ordering::Acquire)
                && self.inner.pending.lock().is_empty();
            if settled {
                let hook = self.inner.on_after_run.read().clone();
                if let Some(hook) = hook {
                    hook();
                }
                self.prune_sources();
                return Ok(());
            }
        }

        self.inner.pending.lock().clear();
        Err(RunError::IterationLimit)
    }

    /// Schedule a pass for the next tick and return immediately.
    pub fn run_deferred(&self) {
        self.run_deferred_inner(None::<fn()>);
    }

    /// Open a batch section, execute `batch`, and schedule a pass for the
    /// next tick.
    pub fn run_deferred_with<F: FnOnce()>(&self, batch: F) {
        self.run_deferred_inner(Some(batch));
    }

    fn run_deferred_inner<F: FnOnce()>(&self, batch: Option<F>) {
        if !self.options().enabled {
            return;
        }
        let _section = BatchSection::enter(self);
        if self
            .inner
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify_tick();
        }
        if let Some(batch) = batch {
            batch();
        }
    }

    /// Whether a deferred pass is scheduled and not yet drained.
    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduled.load(Ordering::Acquire)
    }

    /// Run the scheduled pass, if any. Hosts without a tick loop call this
    /// from their own tick boundary.
    pub fn drain(&self) -> Result<(), RunError> {
        if self.inner.scheduled.swap(false, Ordering::AcqRel) {
            self.run()
        } else {
            Ok(())
        }
    }

    /// Block until no batch section is open. Used by the tick loop before
    /// draining.
    pub(crate) fn wait_for_sections(&self) {
        loop {
            match self.inner.barrier.clone().try_acquire_owned() {
                Ok(permit) => {
                    drop(permit);
                    return;
                }
                Err(_) => thread::sleep(Duration::from_micros(50)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::options::OptionsPatch;
    use crate::updatable::derivation;
    use crate::value::{Record, Value};

    #[test]
    fn disabled_manager_skips_passes() {
        let mgr = Manager::new();
        mgr.set_options(OptionsPatch::default().enabled(false));

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        mgr.reaction(
            derivation(move |_| {
                runs_in.fetch_add(1, Ordering::Relaxed);
                Value::Null
            }),
            true,
        )
        .unwrap();

        mgr.run().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 0);

        mgr.set_options(OptionsPatch::default().enabled(true));
        mgr.run().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn batch_writes_fire_reactions_once() {
        let mgr = Manager::new();
        mgr.set_options(OptionsPatch::default().immediate_reaction(true));

        let record = Record::new();
        record.insert("a", 1);
        record.insert("b", 2);
        let obs = mgr.observe_record(&record);

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let reader = obs.clone();
        mgr.reaction(
            derivation(move |_| {
                runs_in.fetch_add(1, Ordering::Relaxed);
                reader.get("a");
                reader.get("b");
                Value::Null
            }),
            true,
        )
        .unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // Two writes inside one batch: one pass.
        mgr.run_with(|| {
            obs.set("a", 10).unwrap();
            obs.set("b", 20).unwrap();
        })
        .unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn self_looping_reaction_hits_iteration_limit() {
        let mgr = Manager::new();
        let record = Record::new();
        record.insert("n", 0);
        let obs = mgr.observe_record(&record);

        let looper = obs.clone();
        mgr.reaction(
            derivation(move |_| {
                let n = looper.get("n").as_int().unwrap_or(0);
                // Writing a key the reaction also reads: self-invalidation.
                looper.set("n", n + 1).unwrap();
                Value::Null
            }),
            false,
        )
        .unwrap();

        assert_eq!(mgr.run(), Err(RunError::IterationLimit));
        // Scheduler state is cleared; the next pass is a clean no-op.
        mgr.run().unwrap();
    }

    #[test]
    fn on_after_run_fires_after_completed_pass() {
        let mgr = Manager::new();
        let after = Arc::new(AtomicUsize::new(0));
        let after_in = after.clone();
        mgr.set_on_after_run(move || {
            after_in.fetch_add(1, Ordering::Relaxed);
        });

        mgr.run().unwrap();
        assert_eq!(after.load(Ordering::Relaxed), 1);

        mgr.clear_on_after_run();
        mgr.run().unwrap();
        assert_eq!(after.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn deferred_pass_waits_for_drain() {
        let mgr = Manager::new();
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

        // Deferred mode: nothing ran yet, a pass is scheduled.
        assert_eq!(runs.load(Ordering::Relaxed), 0);
        assert!(mgr.is_scheduled());

        mgr.drain().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert!(!mgr.is_scheduled());

        // Nothing scheduled: drain is a no-op.
        mgr.drain().unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }
}
