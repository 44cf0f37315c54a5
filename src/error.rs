use thiserror::Error;

/// Errors surfaced by a reaction pass.
///
/// Most failure kinds in this engine are deliberately not errors: wrapping a
/// non-record value returns the argument unchanged, and a cross-referencing
/// derivation emits a diagnostic and yields `Null` instead of recursing.
/// The one hard failure is a reaction pass that never settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RunError {
    /// `run()` exceeded its fixed-point iteration bound. This happens when a
    /// reaction keeps invalidating state it also depends on (for example by
    /// writing a key it reads). The pending set is cleared before returning.
    #[error("reaction pass did not settle after 10 iterations; aborting to break the invalidation loop")]
    IterationLimit,
}
