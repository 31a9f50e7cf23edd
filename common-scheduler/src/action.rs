//! Actions as explicit state machines. No action relies on a host
//! async runtime for its own scheduling (spec.md §9 "coroutines →
//! explicit task state"); `poll` is called at most once per wave and
//! must return promptly.

use crate::addr::{Addr, ReadSpec};
use std::collections::BTreeSet;

/// Opaque handle for a registered action, stable for the action's
/// lifetime in the scheduler.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) u64);

/// Opaque handle for a `run()` scope, used to group an action and its
/// descendants (sub-recipes) for cancellation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RunId(pub(crate) u64);

/// Outcome of a single `poll` call.
#[derive(Clone, Debug)]
pub enum PollResult {
    /// The action ran to completion for this wave; its declared writes
    /// may now be considered committed.
    Ready,
    /// The action cannot make progress until one of `on` changes.
    /// These addresses are folded into the action's effective read set
    /// until the next successful `Ready`.
    Blocked(BTreeSet<Addr>),
    /// The action made partial progress and should be polled again
    /// next wave even though nothing it reads has changed.
    Yielded,
}

/// A schedulable unit of work: a node invocation, a stream handler
/// re-invocation, or any other action with declared reads/writes.
pub trait Action: Send {
    /// Addresses this action consults. Addresses marked
    /// `ignore_for_scheduling` do not cause re-scheduling on write.
    fn reads(&self) -> &[ReadSpec];

    /// Addresses this action may write when polled to `Ready`.
    fn writes(&self) -> &[Addr];

    /// Advance the action's internal state machine by one step.
    fn poll(&mut self) -> PollResult;
}
