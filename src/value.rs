//! Dynamic value model observed by the engine.
//!
//! The engine has no proxy primitive to lean on, so user data lives in a
//! small dynamic tree: [`Record`] (keyed map with an optional prototype) and
//! [`Sequence`] (ordered list), both `Arc`-shared so a wrapper and its source
//! refer to the same storage. Mutating a source through these raw handles
//! does NOT notify the engine; reactivity flows only through the observable
//! wrapper.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::hash::FastIndexMap;
use crate::observable::Obs;
use crate::updatable::{SetterFn, UpdatableFn};

/// A callable stored inside observed data. Callables are returned verbatim
/// by reads and are never observed themselves.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Source ids are unique per process so that a subscription table can refer
/// to prototype-chain members across managers without holding them alive.
static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

fn next_source_id() -> u64 {
    NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A key of an observed record or sequence.
///
/// Record keys are names; sequence elements are addressed by index, with
/// `"length"` as a name key. The configured pseudo-keys (`$$watch`,
/// `$$watchDeep`, `$$dataSource`) are ordinary [`Key::Name`] values that the
/// wrapper interprets instead of the source.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Key {
    Name(Arc<str>),
    Index(usize),
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Name(Arc::from(s))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Name(Arc::from(s.as_str()))
    }
}

impl From<Arc<str>> for Key {
    fn from(s: Arc<str>) -> Self {
        Key::Name(s)
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(name) => f.write_str(name),
            Key::Index(i) => write!(f, "{i}"),
        }
    }
}

/// A dynamic value.
///
/// `Value::Obs` is the transparent-wrapper variant: `observable()` maps
/// records and sequences to it and leaves every other variant unchanged.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Func(NativeFn),
    Record(Record),
    Seq(Sequence),
    Obs(Obs),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_obs(&self) -> Option<&Obs> {
        match self {
            Value::Obs(o) => Some(o),
            _ => None,
        }
    }

    /// Referential equality, mirroring `===`: value equality for primitives
    /// (`NaN != NaN`), pointer identity for records, sequences, callables and
    /// wrappers. Writes that store a referentially-equal value are no-ops.
    pub fn ref_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Obs(a), Value::Obs(b)) => a == b,
            _ => false,
        }
    }

    /// The source behind this value, if it is an observable record/sequence
    /// or a wrapper over one.
    pub(crate) fn as_source(&self) -> Option<Source> {
        match self {
            Value::Record(r) => Some(Source::Record(r.clone())),
            Value::Seq(s) => Some(Source::Seq(s.clone())),
            Value::Obs(o) => Some(o.source().clone()),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.ref_eq(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Func(_) => f.write_str("Func(..)"),
            Value::Record(r) => r.fmt(f),
            Value::Seq(s) => s.fmt(f),
            Value::Obs(o) => o.fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s.as_str()))
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(r)
    }
}

impl From<Sequence> for Value {
    fn from(s: Sequence) -> Self {
        Value::Seq(s)
    }
}

impl From<Obs> for Value {
    fn from(o: Obs) -> Self {
        Value::Obs(o)
    }
}

/// One property slot of a record: plain data, or an accessor installed by
/// `computed`.
pub(crate) enum Slot {
    Data(Value),
    Accessor {
        get: UpdatableFn,
        set: Option<SetterFn>,
    },
}

/// A user-owned keyed record, optionally inheriting keys from a prototype
/// record. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct Record {
    inner: Arc<RecordInner>,
}

pub(crate) struct RecordInner {
    id: u64,
    slots: RwLock<FastIndexMap<Key, Slot>>,
    proto: RwLock<Option<Record>>,
}

impl Record {
    pub fn new() -> Record {
        Record {
            inner: Arc::new(RecordInner {
                id: next_source_id(),
                slots: RwLock::new(FastIndexMap::default()),
                proto: RwLock::new(None),
            }),
        }
    }

    /// A fresh record inheriting keys from `proto` (the `Object.create`
    /// shape).
    pub fn with_proto(proto: &Record) -> Record {
        let record = Record::new();
        *record.inner.proto.write() = Some(proto.clone());
        record
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Store an own data slot. Raw mutation: no notification.
    pub fn insert(&self, key: impl Into<Key>, value: impl Into<Value>) {
        self.inner
            .slots
            .write()
            .insert(key.into(), Slot::Data(value.into()));
    }

    /// Remove an own slot. Raw mutation: no notification.
    pub fn remove(&self, key: &Key) -> bool {
        self.inner.slots.write().shift_remove(key).is_some()
    }

    /// Own data value at `key`; `None` for absent keys and accessors.
    pub fn get(&self, key: &Key) -> Option<Value> {
        match self.inner.slots.read().get(key) {
            Some(Slot::Data(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn has_own(&self, key: &Key) -> bool {
        self.inner.slots.read().contains_key(key)
    }

    pub(crate) fn own_accessor(&self, key: &Key) -> Option<(UpdatableFn, Option<SetterFn>)> {
        match self.inner.slots.read().get(key) {
            Some(Slot::Accessor { get, set }) => Some((get.clone(), set.clone())),
            _ => None,
        }
    }

    pub(crate) fn define_accessor(&self, key: Key, get: UpdatableFn, set: Option<SetterFn>) {
        self.inner
            .slots
            .write()
            .insert(key, Slot::Accessor { get, set });
    }

    pub fn proto(&self) -> Option<Record> {
        self.inner.proto.read().clone()
    }

    /// Replace the prototype. A prototype chain must stay acyclic; an
    /// assignment that would close a cycle is ignored.
    pub fn set_proto(&self, proto: Option<Record>) {
        if let Some(p) = &proto {
            let mut cursor = Some(p.clone());
            while let Some(r) = cursor {
                if r == *self {
                    return;
                }
                cursor = r.proto();
            }
        }
        *self.inner.proto.write() = proto;
    }

    /// Read `key` through the prototype chain (own data first). Accessors on
    /// ancestors do not participate; only the directly-accessed record's own
    /// accessor is evaluated, by the wrapper.
    pub fn lookup(&self, key: &Key) -> Value {
        let mut cursor = Some(self.clone());
        while let Some(r) = cursor {
            if let Some(v) = r.get(key) {
                return v;
            }
            cursor = r.proto();
        }
        Value::Null
    }

    pub fn own_keys(&self) -> Vec<Key> {
        self.inner.slots.read().keys().cloned().collect()
    }

    pub(crate) fn own_data_values(&self) -> Vec<Value> {
        self.inner
            .slots
            .read()
            .values()
            .filter_map(|slot| match slot {
                Slot::Data(v) => Some(v.clone()),
                Slot::Accessor { .. } => None,
            })
            .collect()
    }
}

impl Default for Record {
    fn default() -> Self {
        Record::new()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Record {}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record(#{})", self.inner.id)
    }
}

/// A user-owned ordered sequence. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct Sequence {
    inner: Arc<SeqInner>,
}

pub(crate) struct SeqInner {
    id: u64,
    items: RwLock<Vec<Value>>,
}

impl Sequence {
    pub fn new() -> Sequence {
        Sequence::from_values(Vec::new())
    }

    pub fn from_values(items: impl IntoIterator<Item = Value>) -> Sequence {
        Sequence {
            inner: Arc::new(SeqInner {
                id: next_source_id(),
                items: RwLock::new(items.into_iter().collect()),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.items.read().get(index).cloned()
    }

    /// Raw element store; writing one past the end extends with `Null`.
    pub fn set(&self, index: usize, value: Value) {
        let mut items = self.inner.items.write();
        if index >= items.len() {
            items.resize(index + 1, Value::Null);
        }
        items[index] = value;
    }

    /// Raw append.
    pub fn push(&self, value: Value) {
        self.inner.items.write().push(value);
    }

    /// Raw length adjustment; growing fills with `Null`.
    pub fn resize_len(&self, len: usize) {
        self.inner.items.write().resize(len, Value::Null);
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner.items.read().clone()
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Sequence::new()
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Sequence {}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence(#{}, len={})", self.inner.id, self.len())
    }
}

/// An observed source: the record or sequence behind a wrapper.
#[derive(Clone, PartialEq, Eq)]
pub enum Source {
    Record(Record),
    Seq(Sequence),
}

impl Source {
    pub(crate) fn id(&self) -> u64 {
        match self {
            Source::Record(r) => r.id(),
            Source::Seq(s) => s.id(),
        }
    }

    pub(crate) fn has_own(&self, key: &Key) -> bool {
        match self {
            Source::Record(r) => r.has_own(key),
            Source::Seq(s) => match key {
                Key::Index(i) => *i < s.len(),
                Key::Name(name) => &**name == "length",
            },
        }
    }

    pub(crate) fn as_record(&self) -> Option<&Record> {
        match self {
            Source::Record(r) => Some(r),
            Source::Seq(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Source::Record(r) => Value::Record(r.clone()),
            Source::Seq(s) => Value::Seq(s.clone()),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakSource {
        match self {
            Source::Record(r) => WeakSource::Record(Arc::downgrade(&r.inner)),
            Source::Seq(s) => WeakSource::Seq(Arc::downgrade(&s.inner)),
        }
    }

    /// Nested records/sequences reachable through own data values, with
    /// stored wrappers unwrapped to their sources. Used by the deep walk.
    pub(crate) fn child_sources(&self) -> Vec<Source> {
        let values = match self {
            Source::Record(r) => r.own_data_values(),
            Source::Seq(s) => s.values(),
        };
        values.iter().filter_map(Value::as_source).collect()
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Record(r) => r.fmt(f),
            Source::Seq(s) => s.fmt(f),
        }
    }
}

/// Weak counterpart of [`Source`] held by the manager's registry, so the
/// source↔wrapper pair is reclaimable once user code drops the source.
pub(crate) enum WeakSource {
    Record(Weak<RecordInner>),
    Seq(Weak<SeqInner>),
}

impl WeakSource {
    pub(crate) fn upgrade(&self) -> Option<Source> {
        match self {
            WeakSource::Record(w) => w.upgrade().map(|inner| Source::Record(Record { inner })),
            WeakSource::Seq(w) => w.upgrade().map(|inner| Source::Seq(Sequence { inner })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_eq_matches_strict_equality() {
        assert!(Value::Int(1).ref_eq(&Value::Int(1)));
        assert!(!Value::Int(1).ref_eq(&Value::Float(1.0)));
        assert!(!Value::Float(f64::NAN).ref_eq(&Value::Float(f64::NAN)));
        assert!(Value::str("a").ref_eq(&Value::str("a")));

        let r = Record::new();
        assert!(Value::Record(r.clone()).ref_eq(&Value::Record(r.clone())));
        assert!(!Value::Record(r).ref_eq(&Value::Record(Record::new())));
    }

    #[test]
    fn record_lookup_walks_prototype_chain() {
        let base = Record::new();
        base.insert("a", 1);
        let mid = Record::with_proto(&base);
        mid.insert("b", 2);
        let leaf = Record::with_proto(&mid);

        assert_eq!(leaf.lookup(&"a".into()), Value::Int(1));
        assert_eq!(leaf.lookup(&"b".into()), Value::Int(2));
        assert_eq!(leaf.lookup(&"c".into()), Value::Null);
        assert!(!leaf.has_own(&"a".into()));

        leaf.insert("a", 7);
        assert_eq!(leaf.lookup(&"a".into()), Value::Int(7));
    }

    #[test]
    fn proto_cycle_assignment_is_ignored() {
        let a = Record::new();
        let b = Record::with_proto(&a);
        a.set_proto(Some(b));
        assert!(a.proto().is_none());
    }

    #[test]
    fn sequence_extends_on_out_of_range_set() {
        let seq = Sequence::from_values([Value::Int(1)]);
        seq.set(3, Value::Int(4));
        assert_eq!(seq.len(), 4);
        assert_eq!(seq.get(1), Some(Value::Null));
        assert_eq!(seq.get(3), Some(Value::Int(4)));

        seq.resize_len(2);
        assert_eq!(seq.len(), 2);
    }
}
