//! The engine instance.
//!
//! One [`Manager`] owns every piece of engine state: the weak source
//! registry with its per-source subscription tables, the updatable arena and
//! intern cache, the call stack of executing updatables, the pending-reaction
//! set, the batch-section bookkeeping and the options record. A process-wide
//! default manager exists as a convenience; every public helper is a bound
//! method of one instance, and the crate-root free functions delegate to the
//! default.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, LazyLock, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::arena::{UpdatableArena, UpdatableId};
use crate::hash::{FastHash, FastIndexSet};
use crate::observable::SubTable;
use crate::options::{Options, OptionsPatch};
use crate::updatable::InternKey;
use crate::value::{Source, WeakSource};

pub(crate) type DiagnosticSink = Arc<dyn Fn(&str) + Send + Sync>;
pub(crate) type AfterRunHook = Arc<dyn Fn() + Send + Sync>;

/// Registry entry of one observed source: a weak handle (the pair is
/// reclaimable once user code drops the source) plus its subscription table.
pub(crate) struct SourceEntry {
    pub(crate) source: WeakSource,
    pub(crate) subs: RwLock<SubTable>,
}

pub(crate) struct ManagerInner {
    /// Memoized derivations.
    pub(crate) arena: UpdatableArena,
    /// Observed sources, weakly keyed by source id.
    pub(crate) sources: papaya::HashMap<u64, SourceEntry>,
    /// Intern cache: `(host, function)` → updatable.
    pub(crate) interned: papaya::HashMap<InternKey, UpdatableId>,
    /// Currently executing updatables, innermost last.
    pub(crate) stack: Mutex<Vec<UpdatableId>>,
    /// Invalidated reactions awaiting a pass, in insertion order.
    pub(crate) pending: Mutex<FastIndexSet<UpdatableId>>,
    /// True while no reaction is known stale.
    pub(crate) valid: AtomicBool,
    /// Nesting depth of open batch sections.
    pub(crate) section_depth: AtomicUsize,
    /// Barrier held while a batch section is open; the tick loop waits on it
    /// before draining.
    pub(crate) barrier: Arc<Semaphore>,
    pub(crate) held_permit: Mutex<Option<OwnedSemaphorePermit>>,
    /// Scheduled-run token set by `run_deferred`.
    pub(crate) scheduled: AtomicBool,
    /// Wake-up channel of the attached tick loop, if any.
    pub(crate) notifier: OnceLock<Sender<()>>,
    pub(crate) options: RwLock<Options>,
    pub(crate) on_after_run: RwLock<Option<AfterRunHook>>,
    pub(crate) sink: RwLock<DiagnosticSink>,
    /// Sources with an in-progress deep walk (cycle suppression).
    pub(crate) deep_walks: Mutex<HashSet<u64, FastHash>>,
}

/// One reactive engine instance. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Manager {
    pub(crate) inner: Arc<ManagerInner>,
}

static DEFAULT_MANAGER: LazyLock<Manager> = LazyLock::new(Manager::new);

impl Manager {
    pub fn new() -> Manager {
        Manager {
            inner: Arc::new(ManagerInner {
                arena: UpdatableArena::new(),
                sources: papaya::HashMap::new(),
                interned: papaya::HashMap::new(),
                stack: Mutex::new(Vec::new()),
                pending: Mutex::new(FastIndexSet::default()),
                valid: AtomicBool::new(true),
                section_depth: AtomicUsize::new(0),
                barrier: Arc::new(Semaphore::new(1)),
                held_permit: Mutex::new(None),
                scheduled: AtomicBool::new(false),
                notifier: OnceLock::new(),
                options: RwLock::new(Options::default()),
                on_after_run: RwLock::new(None),
                sink: RwLock::new(Arc::new(|message: &str| eprintln!("{message}"))),
                deep_walks: Mutex::new(HashSet::default()),
            }),
        }
    }

    /// The process-wide default manager.
    pub fn shared() -> &'static Manager {
        &DEFAULT_MANAGER
    }

    /// A snapshot of the current options.
    pub fn options(&self) -> Options {
        self.inner.options.read().clone()
    }

    /// Merge a partial options record over the current one.
    pub fn set_options(&self, patch: OptionsPatch) {
        self.inner.options.write().apply(patch);
    }

    /// Hook invoked after each completed reaction pass.
    pub fn set_on_after_run(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_after_run.write() = Some(Arc::new(hook));
    }

    pub fn clear_on_after_run(&self) {
        *self.inner.on_after_run.write() = None;
    }

    /// Replace the diagnostic sink (defaults to stderr).
    pub fn set_diagnostic_sink(&self, sink: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.sink.write() = Arc::new(sink);
    }

    pub(crate) fn warn(&self, message: &str) {
        let sink = self.inner.sink.read().clone();
        sink(message);
    }

    pub(crate) fn ptr_eq(&self, other: &Manager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ManagerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn ensure_source(&self, source: &Source) {
        let map = self.inner.sources.pin();
        map.get_or_insert_with(source.id(), || SourceEntry {
            source: source.downgrade(),
            subs: RwLock::new(SubTable::default()),
        });
    }

    pub(crate) fn is_registered_source(&self, id: u64) -> bool {
        self.inner
            .sources
            .pin()
            .get(&id)
            .is_some_and(|entry| entry.source.upgrade().is_some())
    }

    pub(crate) fn source_by_id(&self, id: u64) -> Option<Source> {
        self.inner
            .sources
            .pin()
            .get(&id)
            .and_then(|entry| entry.source.upgrade())
    }

    pub(crate) fn with_subs<R>(&self, id: u64, f: impl FnOnce(&mut SubTable) -> R) -> Option<R> {
        let map = self.inner.sources.pin();
        map.get(&id).map(|entry| f(&mut entry.subs.write()))
    }

    /// Drop registry entries whose source was reclaimed, along with the
    /// interned updatables those sources hosted. Called opportunistically
    /// after a completed reaction pass.
    pub(crate) fn prune_sources(&self) {
        let sources = self.inner.sources.pin();
        let dead: SmallVec<[u64; 8]> = sources
            .iter()
            .filter(|(_, entry)| entry.source.upgrade().is_none())
            .map(|(id, _)| *id)
            .collect();
        if dead.is_empty() {
            return;
        }
        for id in &dead {
            sources.remove(id);
        }

        let interned = self.inner.interned.pin();
        let stale: SmallVec<[InternKey; 8]> = interned
            .iter()
            .filter(|(key, _)| key.host != 0 && dead.contains(&key.host))
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(&id) = interned.get(&key) {
                self.inner.pending.lock().shift_remove(&id);
                self.inner.arena.remove(id);
            }
            interned.remove(&key);
        }
    }

    pub(crate) fn in_batch_section(&self) -> bool {
        self.inner.section_depth.load(Ordering::Acquire) > 0
    }

    pub(crate) fn notify_tick(&self) {
        if let Some(tx) = self.inner.notifier.get() {
            // A closed channel just means the loop stopped.
            let _ = tx.send(());
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new()
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Manager({:p})", Arc::as_ptr(&self.inner))
    }
}
