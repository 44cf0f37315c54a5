//! Fine-grained reactive data manager.
//!
//! Wrap records and sequences in transparent observers, derive values with
//! memoized functions whose reads are tracked automatically, and register
//! reactions that re-run when the data they touched changes. Tracking is
//! lazy (nothing recomputes until demanded), automatic (no subscription
//! wiring) and fine-grained (per key on each observed record).
//!
//! # Quick Start
//!
//! ```ignore
//! use observant::{derivation, Manager, Record, Value};
//!
//! let mgr = Manager::new();
//!
//! let data = Record::new();
//! data.insert("a", 1);
//! data.insert("b", 2);
//! let obs = mgr.observe_record(&data);
//!
//! // A computed property: memoized, recomputed only after a relevant write.
//! mgr.computed(&data, "sum", derivation(|cx| {
//!     let a = cx.get("a").as_int().unwrap_or(0);
//!     let b = cx.get("b").as_int().unwrap_or(0);
//!     Value::Int(a + b)
//! }), None);
//! assert_eq!(obs.get("sum"), Value::Int(3));
//!
//! // A reaction: re-runs on the next pass after its reads are invalidated.
//! mgr.reaction(derivation({
//!     let obs = obs.clone();
//!     move |_| obs.get("sum")
//! }), true)?;
//!
//! obs.set("a", 10)?;   // invalidates `sum` and the reaction
//! mgr.run()?;          // drains the pending reactions
//! ```
//!
//! # Core Types
//!
//! - [`Manager`] - one engine instance owning all state. [`Manager::shared`]
//!   is a process-wide default for convenience.
//! - [`Record`] / [`Sequence`] / [`Value`] - the observed data model.
//! - [`Obs`] - the transparent wrapper; reads register dependencies, writes
//!   invalidate them. Pseudo-keys (`$$watch`, `$$watchDeep`, `$$dataSource`)
//!   are interpreted by the wrapper.
//! - [`Updatable`] - a memoized derivation, interned per host and function.
//! - [`TickLoop`] - optional background thread draining deferred passes;
//!   hosts with their own event loop call [`Manager::drain`] instead.
//!
//! # Scheduling
//!
//! By default writes schedule a deferred pass; with the `immediate_reaction`
//! option each write outside a batch drains synchronously. Batch writes with
//! [`Manager::run_with`] to fire reactions once per batch. A reaction that
//! keeps invalidating its own reads is cut off with
//! [`RunError::IterationLimit`].

mod arena;
mod error;
mod executor;
mod hash;
mod manager;
mod observable;
mod options;
mod scheduler;
mod updatable;
mod value;

pub use error::RunError;
pub use executor::TickLoop;
pub use hash::FastHash;
pub use manager::Manager;
pub use observable::Obs;
pub use options::{Options, OptionsPatch};
pub use scheduler::MAX_ITERATIONS;
pub use updatable::{
    derivation, setter, EvalContext, InvalidateHook, SetterFn, Updatable, UpdatableFn,
    UpdatableOptions, UserFn,
};
pub use value::{Key, NativeFn, Record, Sequence, Value};

/// [`Manager::observable`] on the default manager.
pub fn observable(value: &Value) -> Value {
    Manager::shared().observable(value)
}

/// [`Manager::is_observable`] on the default manager.
pub fn is_observable(value: &Value) -> bool {
    Manager::shared().is_observable(value)
}

/// [`Manager::computed`] on the default manager.
pub fn computed(obj: &Record, key: impl Into<Key>, get: UpdatableFn, set: Option<SetterFn>) {
    Manager::shared().computed(obj, key, get, set);
}

/// [`Manager::updatable`] on the default manager.
pub fn updatable(f: impl Into<UserFn>, options: UpdatableOptions) -> Updatable {
    Manager::shared().updatable(f, options)
}

/// [`Manager::reaction`] on the default manager.
pub fn reaction(f: impl Into<UserFn>, run_now: bool) -> Result<Updatable, RunError> {
    Manager::shared().reaction(f, run_now)
}

/// [`Manager::run`] on the default manager.
pub fn run() -> Result<(), RunError> {
    Manager::shared().run()
}

/// [`Manager::run_with`] on the default manager.
pub fn run_with<F: FnOnce()>(batch: F) -> Result<(), RunError> {
    Manager::shared().run_with(batch)
}

/// [`Manager::run_deferred`] on the default manager.
pub fn run_deferred() {
    Manager::shared().run_deferred()
}

/// [`Manager::run_deferred_with`] on the default manager.
pub fn run_deferred_with<F: FnOnce()>(batch: F) {
    Manager::shared().run_deferred_with(batch)
}

/// [`Manager::drain`] on the default manager.
pub fn drain() -> Result<(), RunError> {
    Manager::shared().drain()
}

/// [`Manager::set_options`] on the default manager.
pub fn set_options(patch: OptionsPatch) {
    Manager::shared().set_options(patch)
}
