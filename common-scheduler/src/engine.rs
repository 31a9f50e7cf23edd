//! Wave-based cooperative scheduler (spec.md §4.8).
//!
//! Single-threaded, no host async runtime: a `run()` call drives waves
//! until the dirty set is empty or `max_iterations_per_run` is
//! exhausted. Each wave topologically orders only the actions that are
//! dirty *this* wave; actions newly dirtied by this wave's writes are
//! deferred to the next wave, matching the "re-collect after the wave"
//! rule.

use crate::action::{Action, ActionId, PollResult, RunId};
use crate::addr::{Addr, ReadSpec};
use crate::error::{Result, SchedulerError};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_MAX_ITERATIONS_PER_RUN: u32 = 1000;

struct Registered {
    action: Box<dyn Action>,
    run_id: RunId,
    /// Addresses this action became blocked on during its last poll;
    /// folded into its effective read set until it next completes.
    blocked_on: BTreeSet<Addr>,
}

impl Registered {
    fn effective_reads(&self) -> impl Iterator<Item = &Addr> {
        self.action
            .reads()
            .iter()
            .filter(|r| !r.ignore_for_scheduling)
            .map(|r: &ReadSpec| &r.addr)
            .chain(self.blocked_on.iter())
    }
}

/// Summary of one `run()` call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    pub waves: u32,
    pub actions_polled: u32,
}

pub struct Scheduler {
    actions: BTreeMap<ActionId, Registered>,
    next_action_id: u64,
    next_run_id: u64,
    run_parent: BTreeMap<RunId, RunId>,
    run_members: BTreeMap<RunId, BTreeSet<ActionId>>,
    dirty: BTreeSet<ActionId>,
    max_iterations_per_run: u32,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            actions: BTreeMap::new(),
            next_action_id: 0,
            next_run_id: 0,
            run_parent: BTreeMap::new(),
            run_members: BTreeMap::new(),
            dirty: BTreeSet::new(),
            max_iterations_per_run: DEFAULT_MAX_ITERATIONS_PER_RUN,
        }
    }

    pub fn with_max_iterations_per_run(mut self, max: u32) -> Self {
        self.max_iterations_per_run = max;
        self
    }

    /// Opens a new run scope, optionally nested under `parent` (a
    /// sub-recipe). Cancelling `parent` later also cancels this run.
    pub fn begin_run(&mut self, parent: Option<RunId>) -> RunId {
        let id = RunId(self.next_run_id);
        self.next_run_id += 1;
        if let Some(parent) = parent {
            self.run_parent.insert(id, parent);
        }
        self.run_members.entry(id).or_default();
        id
    }

    /// Registers a new action under `run_id`. Freshly registered
    /// actions are dirty so they run at least once.
    pub fn register(&mut self, run_id: RunId, action: Box<dyn Action>) -> ActionId {
        let id = ActionId(self.next_action_id);
        self.next_action_id += 1;
        self.actions.insert(
            id,
            Registered { action, run_id, blocked_on: BTreeSet::new() },
        );
        self.run_members.entry(run_id).or_default().insert(id);
        self.dirty.insert(id);
        id
    }

    /// Removes a single action, independent of its run.
    pub fn cancel_action(&mut self, id: ActionId) -> Result<()> {
        let registered = self.actions.remove(&id).ok_or(SchedulerError::UnknownAction(id))?;
        if let Some(members) = self.run_members.get_mut(&registered.run_id) {
            members.remove(&id);
        }
        self.dirty.remove(&id);
        Ok(())
    }

    /// Cancels `run_id` and every run nested under it (sub-recipes),
    /// removing all of their actions. Idempotent: cancelling an
    /// already-cancelled or unknown run is a no-op.
    pub fn cancel(&mut self, run_id: RunId) {
        let mut condemned = BTreeSet::new();
        let mut frontier = vec![run_id];
        while let Some(r) = frontier.pop() {
            if !condemned.insert(r) {
                continue;
            }
            let children: Vec<RunId> = self
                .run_parent
                .iter()
                .filter(|(_, parent)| **parent == r)
                .map(|(child, _)| *child)
                .collect();
            frontier.extend(children);
        }
        for r in &condemned {
            if let Some(members) = self.run_members.remove(r) {
                for id in members {
                    self.actions.remove(&id);
                    self.dirty.remove(&id);
                }
            }
            self.run_parent.remove(r);
        }
    }

    /// Marks every action whose effective read set covers `addr` as
    /// dirty. This is also how stream events propagate: writing to a
    /// stream address dirties every handler action that reads it, and
    /// those handlers run in the next `run()` wave.
    pub fn notify_write(&mut self, addr: &Addr) {
        Self::mark_dirty_from_write(&self.actions, addr, &mut self.dirty);
    }

    fn mark_dirty_from_write(
        actions: &BTreeMap<ActionId, Registered>,
        addr: &Addr,
        dirty: &mut BTreeSet<ActionId>,
    ) {
        for (id, registered) in actions {
            if registered.effective_reads().any(|r| r.covers_write(addr)) {
                dirty.insert(*id);
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.dirty.is_empty()
    }

    /// Drives waves until the dirty set empties, bounded by
    /// `max_iterations_per_run`.
    pub fn run(&mut self) -> Result<RunReport> {
        let mut report = RunReport::default();
        loop {
            if self.dirty.is_empty() {
                return Ok(report);
            }
            report.waves += 1;
            if report.waves > self.max_iterations_per_run {
                return Err(SchedulerError::NonConvergence { iterations: report.waves - 1 });
            }

            let wave_set: BTreeSet<ActionId> = std::mem::take(&mut self.dirty);
            let order = self.topo_order(&wave_set);
            let mut next_dirty = BTreeSet::new();

            for id in order {
                let mut registered = match self.actions.remove(&id) {
                    Some(r) => r,
                    None => continue, // cancelled mid-wave
                };
                report.actions_polled += 1;
                match registered.action.poll() {
                    PollResult::Ready => {
                        registered.blocked_on.clear();
                        let writes = registered.action.writes().to_vec();
                        self.actions.insert(id, registered);
                        for w in &writes {
                            Self::mark_dirty_from_write(&self.actions, w, &mut next_dirty);
                        }
                    }
                    PollResult::Blocked(on) => {
                        registered.blocked_on = on;
                        self.actions.insert(id, registered);
                        next_dirty.insert(id);
                    }
                    PollResult::Yielded => {
                        self.actions.insert(id, registered);
                        next_dirty.insert(id);
                    }
                }
            }

            self.dirty = next_dirty;
        }
    }

    /// Kahn topological sort over `wave_set` only, ordered by write→read
    /// address coverage. Ties broken by `ActionId` for determinism.
    /// Cycles are broken by forcing in the remaining node with the
    /// lowest current in-degree.
    fn topo_order(&self, wave_set: &BTreeSet<ActionId>) -> Vec<ActionId> {
        let mut out_edges: BTreeMap<ActionId, BTreeSet<ActionId>> = BTreeMap::new();
        let mut in_degree: BTreeMap<ActionId, usize> =
            wave_set.iter().map(|id| (*id, 0)).collect();

        for &a in wave_set {
            let a_writes = self.actions[&a].action.writes();
            if a_writes.is_empty() {
                continue;
            }
            for &b in wave_set {
                if a == b {
                    continue;
                }
                let b_reads: Vec<&Addr> = self.actions[&b].effective_reads().collect();
                let hits = a_writes.iter().any(|w| b_reads.iter().any(|r| r.covers_write(w)));
                if hits && out_edges.entry(a).or_default().insert(b) {
                    *in_degree.get_mut(&b).expect("b in wave_set") += 1;
                }
            }
        }

        let mut remaining = wave_set.clone();
        let mut result = Vec::with_capacity(wave_set.len());
        while !remaining.is_empty() {
            let zero: Vec<ActionId> =
                remaining.iter().copied().filter(|id| in_degree[id] == 0).collect();
            let next = if let Some(min) = zero.iter().min() {
                *min
            } else {
                *remaining.iter().min_by_key(|id| in_degree[id]).expect("remaining non-empty")
            };
            remaining.remove(&next);
            result.push(next);
            if let Some(succs) = out_edges.get(&next) {
                for s in succs {
                    if remaining.contains(s) {
                        if let Some(d) = in_degree.get_mut(s) {
                            *d = d.saturating_sub(1);
                        }
                    }
                }
            }
        }
        result
    }
}
