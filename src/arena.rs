//! Slab-backed storage for updatable metadata.
//!
//! Each manager owns one arena. `UpdatableId` is a lightweight index into
//! the slab; accessing an id whose entry was removed (its host was
//! reclaimed) returns `None` instead of panicking, so stale ids held by
//! subscription lists or the pending set degrade to no-ops.

use std::sync::atomic::AtomicBool;

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use smallvec::SmallVec;

use crate::hash::FastIndexSet;
use crate::updatable::{InvalidateHook, UpdatableFn};
use crate::value::{Key, Value, WeakSource};

/// Identifier of an updatable inside one manager's arena.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UpdatableId(u32);

impl UpdatableId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One key subscription an updatable joined during its last execution.
///
/// Re-executing the updatable first replays these entries to evict it from
/// every list, so stale branches of a derivation drop their subscriptions.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct SubEntry {
    pub(crate) source: u64,
    pub(crate) key: Key,
}

/// Metadata of one memoized derivation.
///
/// Fields use interior mutability so the arena's outer lock is only ever
/// taken for the duration of a metadata access, never across user code.
pub(crate) struct UpdatableMeta {
    /// The user function. Cloned out of the arena before invocation.
    pub(crate) func: UpdatableFn,
    /// Host source id plus a weak handle for building the call context.
    pub(crate) host: Option<(u64, WeakSource)>,
    /// Whether `value` reflects the current world.
    pub(crate) valid: AtomicBool,
    /// Reentrancy flag; a nested demand of a computing updatable is a
    /// cross-reference.
    pub(crate) computing: AtomicBool,
    /// Set when a write invalidated this updatable mid-execution; forces
    /// `valid := false` on completion.
    pub(crate) invalidated_during_run: AtomicBool,
    /// Last computed result (`Null` while invalid).
    pub(crate) value: Mutex<Value>,
    /// Downstream consumers, invalidated transitively.
    pub(crate) deps: Mutex<FastIndexSet<UpdatableId>>,
    /// Subscription teardown entries, replayed before each re-execution.
    pub(crate) uninit: Mutex<SmallVec<[SubEntry; 4]>>,
    /// Invalidation hook; reactions use it to enqueue themselves.
    pub(crate) on_invalidate: Mutex<Option<InvalidateHook>>,
}

impl UpdatableMeta {
    pub(crate) fn new(func: UpdatableFn, host: Option<(u64, WeakSource)>) -> Self {
        Self {
            func,
            host,
            valid: AtomicBool::new(false),
            computing: AtomicBool::new(false),
            invalidated_during_run: AtomicBool::new(false),
            value: Mutex::new(Value::Null),
            deps: Mutex::new(FastIndexSet::default()),
            uninit: Mutex::new(SmallVec::new()),
            on_invalidate: Mutex::new(None),
        }
    }
}

pub(crate) struct UpdatableArena {
    slots: RwLock<Slab<UpdatableMeta>>,
}

impl UpdatableArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Slab::new()),
        }
    }

    pub(crate) fn insert(&self, meta: UpdatableMeta) -> UpdatableId {
        let mut slots = self.slots.write();
        let entry = slots.vacant_entry();
        let key = entry.key();
        entry.insert(meta);
        UpdatableId::new(key as u32)
    }

    /// Access the metadata of `id`. Returns `None` for stale ids.
    pub(crate) fn with<R>(&self, id: UpdatableId, f: impl FnOnce(&UpdatableMeta) -> R) -> Option<R> {
        let slots = self.slots.read();
        slots.get(id.index()).map(f)
    }

    pub(crate) fn remove(&self, id: UpdatableId) -> bool {
        let mut slots = self.slots.write();
        if slots.contains(id.index()) {
            slots.remove(id.index());
            true
        } else {
            false
        }
    }

    pub(crate) fn contains(&self, id: UpdatableId) -> bool {
        self.slots.read().contains(id.index())
    }
}
