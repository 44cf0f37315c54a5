//! The observation layer.
//!
//! A wrapper ([`Obs`]) is the transparent view of one source record or
//! sequence. Reads through the wrapper register the currently executing
//! updatable in the source's per-key subscription table; writes and deletes
//! invalidate the subscribers of the touched key (and of the whole-object
//! watch pseudo-key) and hand control to the scheduler.
//!
//! Wrappers are identified by their source: wrapping the same source twice
//! yields equal wrappers, and wrapping a wrapper is the identity.

use std::fmt;

use smallvec::{smallvec, SmallVec};

use crate::arena::{SubEntry, UpdatableId};
use crate::error::RunError;
use crate::hash::FastIndexMap;
use crate::manager::Manager;
use crate::updatable::EvalContext;
use crate::value::{Key, Record, Sequence, Source, Value};

/// A prototype chain recorded with a delegated subscription, ordered from
/// the directly-accessed record to the providing ancestor.
pub(crate) type ProtoChain = SmallVec<[u64; 4]>;

/// Why an updatable sits in a subscription list: it read the key directly on
/// this source (`at_root`), and/or it inherited the key through the recorded
/// prototype chains.
#[derive(Clone, Default, Debug)]
pub(crate) struct SubMeta {
    pub(crate) at_root: bool,
    pub(crate) chains: SmallVec<[ProtoChain; 1]>,
}

/// Per-source subscription table: observed key → subscribers in insertion
/// order.
#[derive(Default)]
pub(crate) struct SubTable {
    keys: FastIndexMap<Key, FastIndexMap<UpdatableId, SubMeta>>,
}

impl SubTable {
    fn subscribe_root(&mut self, key: Key, id: UpdatableId) {
        self.keys
            .entry(key)
            .or_default()
            .entry(id)
            .or_default()
            .at_root = true;
    }

    fn subscribe_chain(&mut self, key: Key, id: UpdatableId, chain: ProtoChain) {
        let meta = self.keys.entry(key).or_default().entry(id).or_default();
        if !meta.chains.contains(&chain) {
            meta.chains.push(chain);
        }
    }

    pub(crate) fn remove(&mut self, key: &Key, id: UpdatableId) {
        if let Some(list) = self.keys.get_mut(key) {
            list.shift_remove(&id);
        }
    }

    fn snapshot(&self, key: &Key) -> SmallVec<[(UpdatableId, SubMeta); 4]> {
        match self.keys.get(key) {
            Some(list) => list.iter().map(|(id, meta)| (*id, meta.clone())).collect(),
            None => SmallVec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &Key, id: UpdatableId) -> bool {
        self.keys
            .get(key)
            .is_some_and(|list| list.contains_key(&id))
    }
}

/// The transparent wrapper of one source record or sequence.
#[derive(Clone)]
pub struct Obs {
    mgr: Manager,
    source: Source,
}

impl Obs {
    pub fn manager(&self) -> &Manager {
        &self.mgr
    }

    pub(crate) fn source(&self) -> &Source {
        &self.source
    }

    /// The underlying source, as a raw (unwrapped) value.
    pub fn source_value(&self) -> Value {
        self.source.to_value()
    }

    /// Read `key` through the wrapper.
    ///
    /// Pseudo-keys are interpreted here: the data-source key returns the raw
    /// source, the watch key subscribes the executing updatable to any
    /// own-key change and returns the wrapper, the deep-watch key does so
    /// transitively through nested records. Any other key is read from the
    /// source (through its prototype chain), registering the executing
    /// updatable per-key; record/sequence results come back wrapped.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        let key = key.into();
        let options = self.mgr.options();

        if key == Key::Name(options.data_source_key.clone()) {
            return self.source.to_value();
        }

        // An own accessor turns the read into a memoized derivation scoped
        // to this source.
        if let Source::Record(record) = &self.source {
            if let Some((getter, _)) = record.own_accessor(&key) {
                let updatable = self.mgr.intern_updatable(getter, Some(self.source.clone()));
                return updatable.call();
            }
        }

        if key == Key::Name(options.watch_key.clone()) {
            self.mgr
                .register_read(&self.source, Key::Name(options.watch_key.clone()), true);
            return Value::Obs(self.clone());
        }
        if key == Key::Name(options.watch_deep_key.clone()) {
            self.mgr.deep_watch(&self.source, &options.watch_key);
            return Value::Obs(self.clone());
        }

        self.mgr.register_read(&self.source, key.clone(), false);
        self.mgr.wrap_nested(self.raw_lookup(&key))
    }

    /// Write `key` through the wrapper.
    ///
    /// Storing a referentially-equal value is a no-op, except for a
    /// sequence's `length`. Writes during a derivation are permitted; a
    /// derivation writing state it also reads self-invalidates and is cut
    /// off by the scheduler's iteration bound. With `immediate_reaction`
    /// the reaction pass runs synchronously, so [`RunError::IterationLimit`]
    /// surfaces to the writer.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<(), RunError> {
        let key = key.into();
        let value = value.into();

        if let Source::Record(record) = &self.source {
            if let Some((_, set)) = record.own_accessor(&key) {
                if let Some(set) = set {
                    let cx = EvalContext::with_host(self.mgr.clone(), self.clone());
                    set(&cx, value);
                }
                return Ok(());
            }
        }

        let is_seq_length = matches!(
            (&self.source, &key),
            (Source::Seq(_), Key::Name(name)) if &**name == "length"
        );
        if !is_seq_length && self.raw_lookup(&key).ref_eq(&value) {
            return Ok(());
        }

        match (&self.source, &key) {
            (Source::Record(record), _) => record.insert(key.clone(), value),
            (Source::Seq(seq), Key::Index(i)) => seq.set(*i, value),
            (Source::Seq(seq), Key::Name(_)) => {
                // Only `length` is writable by name on a sequence.
                if !is_seq_length {
                    return Ok(());
                }
                if let Value::Int(len) = value {
                    seq.resize_len(len.max(0) as usize);
                }
            }
        }

        self.mgr.update_property(&self.source, &key)
    }

    /// Delete `key` through the wrapper. Always notifies, whether or not the
    /// key was present. Deleting a sequence index stores `Null` (no shift).
    pub fn delete(&self, key: impl Into<Key>) -> Result<(), RunError> {
        let key = key.into();
        match (&self.source, &key) {
            (Source::Record(record), _) => {
                record.remove(&key);
            }
            (Source::Seq(seq), Key::Index(i)) => {
                if *i < seq.len() {
                    seq.set(*i, Value::Null);
                }
            }
            (Source::Seq(_), Key::Name(_)) => {}
        }
        self.mgr.update_property(&self.source, &key)
    }

    fn raw_lookup(&self, key: &Key) -> Value {
        match &self.source {
            Source::Record(record) => record.lookup(key),
            Source::Seq(seq) => match key {
                Key::Index(i) => seq.get(*i).unwrap_or(Value::Null),
                Key::Name(name) if &**name == "length" => Value::Int(seq.len() as i64),
                Key::Name(_) => Value::Null,
            },
        }
    }
}

impl PartialEq for Obs {
    fn eq(&self, other: &Self) -> bool {
        self.mgr.ptr_eq(&other.mgr) && self.source.id() == other.source.id()
    }
}

impl Eq for Obs {}

impl fmt::Debug for Obs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Obs({:?})", self.source)
    }
}

impl Manager {
    /// Wrap a value for observation. Records and sequences come back as
    /// wrappers; wrappers, primitives and callables are returned unchanged.
    /// Idempotent: the wrapper of a source is stable.
    pub fn observable(&self, value: &Value) -> Value {
        match value {
            Value::Record(r) => Value::Obs(self.wrap_source(Source::Record(r.clone()))),
            Value::Seq(s) => Value::Obs(self.wrap_source(Source::Seq(s.clone()))),
            other => other.clone(),
        }
    }

    /// Wrap a record directly.
    pub fn observe_record(&self, record: &Record) -> Obs {
        self.wrap_source(Source::Record(record.clone()))
    }

    /// Wrap a sequence directly.
    pub fn observe_sequence(&self, sequence: &Sequence) -> Obs {
        self.wrap_source(Source::Seq(sequence.clone()))
    }

    pub fn is_observable(&self, value: &Value) -> bool {
        matches!(value, Value::Obs(_))
    }

    pub(crate) fn wrap_source(&self, source: Source) -> Obs {
        self.ensure_source(&source);
        Obs {
            mgr: self.clone(),
            source,
        }
    }

    pub(crate) fn wrap_nested(&self, value: Value) -> Value {
        match value {
            Value::Record(r) => Value::Obs(self.wrap_source(Source::Record(r))),
            Value::Seq(s) => Value::Obs(self.wrap_source(Source::Seq(s))),
            other => other,
        }
    }

    /// Register the executing updatable (if any) as a subscriber of `key` on
    /// `source`, delegating along the prototype chain when enabled.
    ///
    /// Pseudo-key reads pass `force_root`: a watch subscription means
    /// "own-key changes of this source" and never delegates upward.
    pub(crate) fn register_read(&self, source: &Source, key: Key, force_root: bool) {
        let Some(consumer) = self.current_updatable() else {
            return;
        };
        let options = self.options();

        let mut target = source.clone();
        let mut chain: Option<ProtoChain> = None;
        if !force_root && options.prototypes && !source.has_own(&key) {
            if let Some(record) = source.as_record() {
                let mut path: ProtoChain = smallvec![record.id()];
                let mut topmost: Option<Record> = None;
                let mut cursor = record.proto();
                while let Some(ancestor) = cursor {
                    // Delegation only climbs through ancestors that are
                    // themselves observable.
                    if !self.is_registered_source(ancestor.id()) {
                        break;
                    }
                    path.push(ancestor.id());
                    let provides = ancestor.has_own(&key);
                    cursor = ancestor.proto();
                    topmost = Some(ancestor);
                    if provides {
                        break;
                    }
                }
                if let Some(ancestor) = topmost {
                    // Registered on the providing ancestor, or on the
                    // topmost wrapped ancestor when the key is absent from
                    // the whole chain.
                    cov_mark::hit!(proto_delegated_read);
                    target = Source::Record(ancestor);
                    chain = Some(path);
                }
            }
        }

        let entry = SubEntry {
            source: target.id(),
            key: key.clone(),
        };
        self.with_subs(target.id(), |table| match chain.clone() {
            Some(chain) => table.subscribe_chain(key.clone(), consumer, chain),
            None => table.subscribe_root(key.clone(), consumer),
        });
        self.inner.arena.with(consumer, |m| {
            let mut uninit = m.uninit.lock();
            if !uninit.contains(&entry) {
                uninit.push(entry);
            }
        });
    }

    pub(crate) fn unsubscribe(&self, source_id: u64, key: &Key, id: UpdatableId) {
        self.with_subs(source_id, |table| table.remove(key, id));
    }

    /// Subscribe the executing updatable to own-key changes of `source` and
    /// of every record/sequence transitively reachable from it. Re-entrance
    /// into an in-progress walk on the same source (a cycle) is suppressed.
    pub(crate) fn deep_watch(&self, source: &Source, watch_key: &std::sync::Arc<str>) {
        if !self.inner.deep_walks.lock().insert(source.id()) {
            cov_mark::hit!(deep_walk_suppressed);
            return;
        }
        let _guard = DeepWalkGuard {
            mgr: self,
            id: source.id(),
        };

        self.register_read(source, Key::Name(watch_key.clone()), true);
        for child in source.child_sources() {
            self.ensure_source(&child);
            self.deep_watch(&child, watch_key);
        }
    }

    /// Invalidate the subscribers of `key` on `source` (and of the watch
    /// pseudo-key), then hand control to the scheduler unless a batch
    /// section is open.
    pub(crate) fn update_property(&self, source: &Source, key: &Key) -> Result<(), RunError> {
        let options = self.options();
        let watch = Key::Name(options.watch_key.clone());
        let fan_out: SmallVec<[Key; 2]> = if *key == watch {
            smallvec![watch]
        } else {
            smallvec![key.clone(), watch]
        };

        for k in &fan_out {
            let subscribers = self
                .with_subs(source.id(), |table| table.snapshot(k))
                .unwrap_or_default();
            for (id, meta) in subscribers {
                if meta.at_root {
                    self.invalidate(id);
                    continue;
                }
                let mut fire = false;
                for chain in &meta.chains {
                    let Some(pos) = chain.iter().position(|sid| *sid == source.id()) else {
                        continue;
                    };
                    // A record between the accessed descendant and this
                    // source that now overrides the key shadows the write.
                    let shadowed = chain[..pos].iter().any(|sid| {
                        self.source_by_id(*sid)
                            .is_some_and(|closer| closer.has_own(key))
                    });
                    if shadowed {
                        cov_mark::hit!(proto_write_shadowed);
                    } else {
                        fire = true;
                        break;
                    }
                }
                if fire {
                    self.invalidate(id);
                }
            }
        }

        if !self.in_batch_section() {
            if options.immediate_reaction {
                self.run()?;
            } else {
                self.run_deferred();
            }
        }
        Ok(())
    }
}

struct DeepWalkGuard<'a> {
    mgr: &'a Manager,
    id: u64,
}

impl Drop for DeepWalkGuard<'_> {
    fn drop(&mut self) {
        self.mgr.inner.deep_walks.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updatable::{derivation, UpdatableOptions};

    #[test]
    fn wrapping_is_idempotent_and_stable() {
        let mgr = Manager::new();
        let record = Record::new();
        let value = Value::Record(record);

        let a = mgr.observable(&value);
        let b = mgr.observable(&value);
        assert_eq!(a, b);
        assert!(mgr.is_observable(&a));

        // Wrapping a wrapper is the identity.
        let c = mgr.observable(&a);
        assert_eq!(a, c);
    }

    #[test]
    fn non_sources_are_returned_unchanged() {
        let mgr = Manager::new();
        assert_eq!(mgr.observable(&Value::Int(3)), Value::Int(3));
        assert_eq!(mgr.observable(&Value::Null), Value::Null);
        assert!(!mgr.is_observable(&mgr.observable(&Value::str("x"))));

        let func: Value = Value::Func(std::sync::Arc::new(|_| Value::Null));
        assert!(!mgr.is_observable(&mgr.observable(&func)));
    }

    #[test]
    fn nested_records_come_back_wrapped() {
        let mgr = Manager::new();
        let nested = Record::new();
        nested.insert("x", 1);
        let root = Record::new();
        root.insert("child", nested);
        root.insert("n", 5);

        root.insert(
            "f",
            Value::Func(std::sync::Arc::new(|_: &[Value]| Value::Null)),
        );

        let obs = mgr.observe_record(&root);
        assert!(mgr.is_observable(&obs.get("child")));
        assert!(!mgr.is_observable(&obs.get("n")));
        // Callables are returned verbatim, never wrapped.
        assert!(!mgr.is_observable(&obs.get("f")));

        let child = obs.get("child");
        let child_obs = child.as_obs().unwrap();
        assert_eq!(child_obs.get("x"), Value::Int(1));
    }

    #[test]
    fn data_source_key_returns_raw_source() {
        let mgr = Manager::new();
        let record = Record::new();
        let obs = mgr.observe_record(&record);

        let raw = obs.get("$$dataSource");
        assert_eq!(raw, Value::Record(record));
        assert!(!mgr.is_observable(&raw));
    }

    #[test]
    fn referentially_equal_write_is_a_no_op() {
        let mgr = Manager::new();
        let record = Record::new();
        record.insert("a", 1);
        let obs = mgr.observe_record(&record);

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_in = fired.clone();
        let watcher = obs.clone();
        let reaction = mgr
            .reaction(
                derivation(move |_| {
                    fired_in.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    watcher.get("a")
                }),
                false,
            )
            .unwrap();
        mgr.run().unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 1);

        obs.set("a", 1).unwrap();
        mgr.run().unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(reaction.is_valid());
    }

    #[test]
    fn sequence_length_write_always_notifies() {
        let mgr = Manager::new();
        let seq = Sequence::from_values([Value::Int(1), Value::Int(2)]);
        let obs = mgr.observe_sequence(&seq);

        assert_eq!(obs.get("length"), Value::Int(2));
        assert_eq!(obs.get(0usize), Value::Int(1));

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_in = fired.clone();
        let watcher = obs.clone();
        mgr.reaction(
            derivation(move |_| {
                fired_in.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                watcher.get("length")
            }),
            false,
        )
        .unwrap();
        mgr.run().unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 1);

        // Same length, but the length carve-out still notifies.
        obs.set("length", 2).unwrap();
        mgr.run().unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 2);

        obs.set("length", 4).unwrap();
        mgr.run().unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::Relaxed), 3);
        assert_eq!(seq.len(), 4);
    }

    #[test]
    fn branch_switch_drops_stale_subscriptions() {
        let mgr = Manager::new();
        let record = Record::new();
        record.insert("flag", true);
        record.insert("a", 1);
        record.insert("b", 2);
        let obs = mgr.observe_record(&record);

        let runs = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let runs_in = runs.clone();
        let reader = obs.clone();
        let u = mgr.updatable(
            derivation(move |_| {
                runs_in.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if reader.get("flag").as_bool().unwrap_or(false) {
                    reader.get("a")
                } else {
                    reader.get("b")
                }
            }),
            UpdatableOptions::default(),
        );

        assert_eq!(u.call(), Value::Int(1));
        // Writes to the unread branch do not invalidate.
        obs.set("b", 20).unwrap();
        assert!(u.is_valid());

        obs.set("flag", false).unwrap();
        assert!(!u.is_valid());
        cov_mark::check!(uninit_evicted);
        assert_eq!(u.call(), Value::Int(20));

        // The old branch's subscription is gone.
        obs.set("a", 10).unwrap();
        assert!(u.is_valid());

        let id = u.id;
        let on_a = mgr
            .with_subs(record.id(), |table| table.contains(&"a".into(), id))
            .unwrap();
        assert!(!on_a);
    }
}
