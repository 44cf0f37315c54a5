//! The memoization primitive.
//!
//! An updatable wraps a user function together with its dependency metadata.
//! Invoking it returns the cached value while valid; otherwise it tears down
//! the subscriptions of its previous execution, re-runs the function with
//! the manager's call stack tracking reads, and caches the result. Consumers
//! demanding an updatable from inside another derivation are recorded as
//! downstream dependents and invalidated transitively.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::arena::{SubEntry, UpdatableId, UpdatableMeta};
use crate::manager::Manager;
use crate::observable::Obs;
use crate::value::{Key, Record, Source, Value};

/// A user derivation function. Identity (for interning) is the `Arc`
/// allocation: submitting the same clone twice yields the same updatable.
pub type UpdatableFn = Arc<dyn Fn(&EvalContext) -> Value + Send + Sync>;

/// An accessor setter. Runs unmemoized; invalidation flows from whatever
/// keys the setter writes.
pub type SetterFn = Arc<dyn Fn(&EvalContext, Value) + Send + Sync>;

/// Hook fired on every invalidation of an updatable.
pub type InvalidateHook = Arc<dyn Fn() + Send + Sync>;

/// Wrap a closure as an [`UpdatableFn`].
pub fn derivation(f: impl Fn(&EvalContext) -> Value + Send + Sync + 'static) -> UpdatableFn {
    Arc::new(f)
}

/// Wrap a closure as a [`SetterFn`].
pub fn setter(f: impl Fn(&EvalContext, Value) + Send + Sync + 'static) -> SetterFn {
    Arc::new(f)
}

pub(crate) const CROSS_REFERENCE_DIAGNOSTIC: &str = "Detected cross reference inside computed properties! \"undefined\" will be returned to prevent infinite loop";

/// Execution context handed to user functions: the owning manager plus the
/// wrapper of the host record, when the updatable is scoped to one.
pub struct EvalContext {
    manager: Manager,
    this: Option<Obs>,
}

impl EvalContext {
    pub(crate) fn hostless(manager: Manager) -> Self {
        Self {
            manager,
            this: None,
        }
    }

    pub(crate) fn with_host(manager: Manager, this: Obs) -> Self {
        Self {
            manager,
            this: Some(this),
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// The wrapper of the host record, if any.
    pub fn this(&self) -> Option<&Obs> {
        self.this.as_ref()
    }

    /// Tracked read of `key` through the host wrapper; `Null` when hostless.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        match &self.this {
            Some(obs) => obs.get(key),
            None => Value::Null,
        }
    }
}

/// Intern-cache key: host source id (0 is the manager itself) and the user
/// function's allocation address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct InternKey {
    pub(crate) host: u64,
    pub(crate) func: usize,
}

/// Input accepted where a user function is expected. Passing an existing
/// updatable returns it unchanged instead of re-wrapping.
pub enum UserFn {
    Fn(UpdatableFn),
    Updatable(Updatable),
}

impl From<UpdatableFn> for UserFn {
    fn from(f: UpdatableFn) -> Self {
        UserFn::Fn(f)
    }
}

impl From<Updatable> for UserFn {
    fn from(u: Updatable) -> Self {
        UserFn::Updatable(u)
    }
}

/// Options of [`Manager::updatable`].
#[derive(Default)]
pub struct UpdatableOptions {
    /// Host record the updatable is scoped to; defaults to the manager.
    pub host: Option<Record>,
    /// Hook fired on every invalidation.
    pub on_invalidate: Option<InvalidateHook>,
}

impl UpdatableOptions {
    pub fn host(mut self, record: &Record) -> Self {
        self.host = Some(record.clone());
        self
    }

    pub fn on_invalidate(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_invalidate = Some(Arc::new(hook));
        self
    }
}

/// Handle to a memoized derivation. Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct Updatable {
    pub(crate) mgr: Manager,
    pub(crate) id: UpdatableId,
}

impl Updatable {
    /// Demand the value, recomputing only when invalid.
    pub fn call(&self) -> Value {
        self.mgr.invoke(self.id)
    }

    /// Whether the cached value reflects the current world.
    pub fn is_valid(&self) -> bool {
        self.mgr
            .inner
            .arena
            .with(self.id, |m| m.valid.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Force the next demand to recompute.
    pub fn invalidate(&self) {
        self.mgr.invalidate(self.id);
    }
}

impl PartialEq for Updatable {
    fn eq(&self, other: &Self) -> bool {
        self.mgr.ptr_eq(&other.mgr) && self.id == other.id
    }
}

impl Eq for Updatable {}

impl fmt::Debug for Updatable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Updatable(#{})", self.id.index())
    }
}

/// Restores the call stack and the `computing` flag when an execution
/// unwinds, so a panicking derivation leaves the engine reusable.
struct ComputeGuard<'a> {
    mgr: &'a Manager,
    id: UpdatableId,
}

impl<'a> ComputeGuard<'a> {
    fn new(mgr: &'a Manager, id: UpdatableId) -> Self {
        mgr.inner.stack.lock().push(id);
        Self { mgr, id }
    }
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        let mut stack = self.mgr.inner.stack.lock();
        if let Some(pos) = stack.iter().rposition(|id| *id == self.id) {
            stack.remove(pos);
        }
        drop(stack);
        self.mgr
            .inner
            .arena
            .with(self.id, |m| m.computing.store(false, Ordering::Release));
    }
}

impl Manager {
    /// Memoize `f` as an updatable, interned per `(host, function)`.
    ///
    /// A second call with the same host and the same function allocation
    /// returns the same updatable; later `on_invalidate` options are ignored
    /// for an interned hit.
    pub fn updatable(&self, f: impl Into<UserFn>, options: UpdatableOptions) -> Updatable {
        match f.into() {
            UserFn::Updatable(u) => u,
            UserFn::Fn(func) => {
                let host = options.host.map(Source::Record);
                let updatable = self.intern_updatable(func, host);
                if let Some(hook) = options.on_invalidate {
                    self.inner.arena.with(updatable.id, |m| {
                        let mut slot = m.on_invalidate.lock();
                        if slot.is_none() {
                            *slot = Some(hook);
                        }
                    });
                }
                updatable
            }
        }
    }

    /// Install a memoized accessor at `key` on `obj`. Reads through a
    /// wrapper of `obj` evaluate the getter as an updatable scoped to the
    /// record; the setter (if any) runs unmemoized.
    pub fn computed(
        &self,
        obj: &Record,
        key: impl Into<Key>,
        get: UpdatableFn,
        set: Option<SetterFn>,
    ) {
        obj.define_accessor(key.into(), get, set);
    }

    pub(crate) fn intern_updatable(&self, func: UpdatableFn, host: Option<Source>) -> Updatable {
        let key = InternKey {
            host: host.as_ref().map_or(0, Source::id),
            func: Arc::as_ptr(&func) as *const () as usize,
        };
        let interned = self.inner.interned.pin();
        if let Some(&id) = interned.get(&key) {
            if self.inner.arena.contains(id) {
                return Updatable {
                    mgr: self.clone(),
                    id,
                };
            }
        }
        let meta = UpdatableMeta::new(func, host.as_ref().map(|s| (s.id(), s.downgrade())));
        let id = self.inner.arena.insert(meta);
        interned.insert(key, id);
        Updatable {
            mgr: self.clone(),
            id,
        }
    }

    pub(crate) fn current_updatable(&self) -> Option<UpdatableId> {
        self.inner.stack.lock().last().copied()
    }

    /// Invocation semantics of an updatable.
    pub(crate) fn invoke(&self, id: UpdatableId) -> Value {
        // A demand of an updatable that is already computing is a
        // cross-reference; yield Null instead of recursing.
        let computing = self
            .inner
            .arena
            .with(id, |m| m.computing.load(Ordering::Acquire))
            .unwrap_or(false);
        if computing {
            self.warn(CROSS_REFERENCE_DIAGNOSTIC);
            return Value::Null;
        }

        // The executing updatable (if any) becomes a downstream consumer.
        if let Some(consumer) = self.current_updatable() {
            if consumer != id {
                self.inner.arena.with(id, |m| {
                    m.deps.lock().insert(consumer);
                });
            }
        }

        if let Some(Some(value)) = self.inner.arena.with(id, |m| {
            if m.valid.load(Ordering::Acquire) {
                Some(m.value.lock().clone())
            } else {
                None
            }
        }) {
            return value;
        }

        let Some((func, host)) = self.inner.arena.with(id, |m| {
            (
                m.func.clone(),
                m.host.as_ref().and_then(|(_, weak)| weak.upgrade()),
            )
        }) else {
            return Value::Null;
        };

        // Evict this updatable from every subscription list it joined during
        // its previous execution; the re-run re-registers what it still reads.
        let stale: SmallVec<[SubEntry; 4]> = self
            .inner
            .arena
            .with(id, |m| std::mem::take(&mut *m.uninit.lock()))
            .unwrap_or_default();
        if !stale.is_empty() {
            cov_mark::hit!(uninit_evicted);
        }
        for entry in &stale {
            self.unsubscribe(entry.source, &entry.key, id);
        }

        self.inner.arena.with(id, |m| {
            m.computing.store(true, Ordering::Release);
            m.invalidated_during_run.store(false, Ordering::Release);
        });
        let _guard = ComputeGuard::new(self, id);
        let cx = match host {
            Some(source) => EvalContext::with_host(self.clone(), self.wrap_source(source)),
            None => EvalContext::hostless(self.clone()),
        };
        let result = (func)(&cx);

        self.inner.arena.with(id, |m| {
            *m.value.lock() = result.clone();
            // A write that reached back into this updatable mid-execution
            // leaves it invalid, so the next demand recomputes.
            let settled = !m.invalidated_during_run.load(Ordering::Acquire);
            m.valid.store(settled, Ordering::Release);
        });
        result
    }

    /// Invalidate an updatable and, on a valid-to-invalid transition, its
    /// transitive consumers.
    pub(crate) fn invalidate(&self, id: UpdatableId) {
        self.inner.valid.store(false, Ordering::Release);
        let Some((hook, cascade)) = self.inner.arena.with(id, |m| {
            m.invalidated_during_run.store(true, Ordering::Release);
            let hook = m.on_invalidate.lock().clone();
            let was_valid = m.valid.swap(false, Ordering::AcqRel);
            let cascade = if was_valid {
                *m.value.lock() = Value::Null;
                let mut deps = m.deps.lock();
                let snapshot: SmallVec<[UpdatableId; 4]> = deps.iter().copied().collect();
                deps.clear();
                Some(snapshot)
            } else {
                None
            };
            (hook, cascade)
        }) else {
            return;
        };
        if let Some(hook) = hook {
            hook();
        }
        if let Some(deps) = cascade {
            if !deps.is_empty() {
                cov_mark::hit!(invalidate_cascade);
            }
            for dep in deps {
                self.invalidate(dep);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, OnceLock};

    use super::*;

    #[test]
    fn interned_per_host_and_function() {
        let mgr = Manager::new();
        let f = derivation(|_| Value::Int(1));
        let a = mgr.updatable(f.clone(), UpdatableOptions::default());
        let b = mgr.updatable(f.clone(), UpdatableOptions::default());
        assert_eq!(a, b);

        let host = Record::new();
        let c = mgr.updatable(f.clone(), UpdatableOptions::default().host(&host));
        assert_ne!(a, c);

        // Passing an updatable where a function is expected returns it.
        let d = mgr.updatable(a.clone(), UpdatableOptions::default());
        assert_eq!(a, d);
    }

    #[test]
    fn memoizes_until_invalidated() {
        let mgr = Manager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in = runs.clone();
        let u = mgr.updatable(
            derivation(move |_| {
                runs_in.fetch_add(1, Ordering::Relaxed);
                Value::Int(7)
            }),
            UpdatableOptions::default(),
        );

        assert_eq!(runs.load(Ordering::Relaxed), 0);
        assert_eq!(u.call(), Value::Int(7));
        assert_eq!(u.call(), Value::Int(7));
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        u.invalidate();
        assert!(!u.is_valid());
        assert_eq!(u.call(), Value::Int(7));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn on_invalidate_hook_fires_on_every_invalidation() {
        let mgr = Manager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = fired.clone();
        let u = mgr.updatable(
            derivation(|_| Value::Null),
            UpdatableOptions::default().on_invalidate(move || {
                fired_in.fetch_add(1, Ordering::Relaxed);
            }),
        );

        u.call();
        u.invalidate();
        // Already invalid: the hook still fires, the cascade does not repeat.
        u.invalidate();
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn self_demand_reports_cross_reference() {
        let mgr = Manager::new();
        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        mgr.set_diagnostic_sink(move |msg| sink.lock().unwrap().push(msg.to_owned()));

        let slot: Arc<OnceLock<Updatable>> = Arc::new(OnceLock::new());
        let inner_slot = slot.clone();
        let u = mgr.updatable(
            derivation(move |_| match inner_slot.get() {
                Some(me) => me.call(),
                None => Value::Null,
            }),
            UpdatableOptions::default(),
        );
        slot.set(u.clone()).unwrap();

        assert_eq!(u.call(), Value::Null);
        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], CROSS_REFERENCE_DIAGNOSTIC);
    }

    #[test]
    fn consumer_is_invalidated_transitively() {
        let mgr = Manager::new();
        let base = mgr.updatable(derivation(|_| Value::Int(1)), UpdatableOptions::default());

        let base_in = base.clone();
        let outer = mgr.updatable(
            derivation(move |_| base_in.call()),
            UpdatableOptions::default(),
        );

        assert_eq!(outer.call(), Value::Int(1));
        assert!(outer.is_valid());

        cov_mark::check!(invalidate_cascade);
        base.invalidate();
        assert!(!outer.is_valid());
    }
}
