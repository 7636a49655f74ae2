//! Step scheduler.
//!
//! Tracks every node of one deployment as `pending -> ready -> running ->
//! {succeeded | failed}` (or `skipped` when a dependency did not succeed)
//! and decides which ready node runs next. Nodes may be added, and
//! dependencies attached, while the deployment is in progress; the
//! coordinator is the only caller, so no locking is needed.
//!
//! Nodes belong to a phase. Cleanup nodes are released only once every main
//! node is terminal. Gate nodes do not count toward the parallelism bound.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use tracing::{debug, trace};

use super::step::{StepId, StepStatus};

/// Phase a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Creates, updates, reads and anything that must precede them.
    Main,
    /// Deletes released after the main phase.
    Cleanup,
}

#[derive(Debug)]
struct Entry<T> {
    payload: T,
    phase: Phase,
    status: StepStatus,
    limited: bool,
    waiting: usize,
    dependencies: Vec<StepId>,
    dependents: Vec<StepId>,
    blocked_by: Option<StepId>,
}

/// Dependency-aware scheduler with a bounded number of running nodes.
#[derive(Debug)]
pub struct Scheduler<T> {
    entries: Vec<Entry<T>>,
    ready: BTreeSet<StepId>,
    parallelism: usize,
    running: usize,
    open_main: usize,
    halted: bool,
}

impl<T> Scheduler<T> {
    /// Creates a scheduler that runs at most `parallelism` limited nodes at
    /// once. A bound of zero is treated as one.
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        Self {
            entries: Vec::new(),
            ready: BTreeSet::new(),
            parallelism: parallelism.max(1),
            running: 0,
            open_main: 0,
            halted: false,
        }
    }

    /// Adds a node that needs a worker.
    ///
    /// If a dependency has already failed the node starts out skipped.
    pub fn add(&mut self, payload: T, phase: Phase, dependencies: &[StepId]) -> StepId {
        self.insert(payload, phase, dependencies, true)
    }

    /// Adds a main-phase node that completes without a worker.
    pub fn add_gate(&mut self, payload: T, dependencies: &[StepId]) -> StepId {
        self.insert(payload, Phase::Main, dependencies, false)
    }

    fn insert(&mut self, payload: T, phase: Phase, dependencies: &[StepId], limited: bool) -> StepId {
        let id = self.entries.len();
        self.entries.push(Entry {
            payload,
            phase,
            status: StepStatus::Pending,
            limited,
            waiting: 0,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            blocked_by: None,
        });
        if phase == Phase::Main {
            self.open_main += 1;
        }

        for &dependency in dependencies {
            self.add_dependency(id, dependency);
        }
        if self.entries[id].status == StepStatus::Pending && self.entries[id].waiting == 0 {
            self.entries[id].status = StepStatus::Ready;
            self.ready.insert(id);
        }
        id
    }

    /// Makes `id` wait for `dependency`.
    ///
    /// Only nodes that have not been released can gain dependencies. A
    /// cleanup dependency of a main node is promoted along with it. If the
    /// dependency already failed or was skipped, `id` and everything that
    /// waits on it are skipped; their ids are returned.
    pub fn add_dependency(&mut self, id: StepId, dependency: StepId) -> Vec<StepId> {
        if id == dependency || dependency >= self.entries.len() {
            return Vec::new();
        }
        if !matches!(self.entries[id].status, StepStatus::Pending | StepStatus::Ready) {
            debug!("Ignoring dependency on {} for released node {}", dependency, id);
            return Vec::new();
        }
        if self.entries[id].dependencies.contains(&dependency) {
            return Vec::new();
        }

        match self.entries[dependency].status {
            StepStatus::Succeeded => {
                self.entries[id].dependencies.push(dependency);
                Vec::new()
            }
            StepStatus::Failed | StepStatus::Skipped => {
                self.entries[id].dependencies.push(dependency);
                self.skip_from(id, dependency)
            }
            StepStatus::Pending | StepStatus::Ready | StepStatus::Running => {
                self.entries[id].dependencies.push(dependency);
                self.entries[dependency].dependents.push(id);
                self.entries[id].waiting += 1;
                if self.entries[id].status == StepStatus::Ready {
                    self.ready.remove(&id);
                    self.entries[id].status = StepStatus::Pending;
                }
                // A main node can never wait on the cleanup phase.
                if self.entries[id].phase == Phase::Main
                    && self.entries[dependency].phase == Phase::Cleanup
                {
                    self.promote(dependency);
                }
                Vec::new()
            }
        }
    }

    /// Moves a cleanup node, and every unfinished node it waits for, into
    /// the main phase.
    pub fn promote(&mut self, id: StepId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let entry = &mut self.entries[current];
            if entry.phase == Phase::Main || entry.status.is_terminal() {
                continue;
            }
            entry.phase = Phase::Main;
            self.open_main += 1;
            trace!("Promoted node {} to the main phase", current);
            stack.extend(entry.dependencies.iter().copied());
        }
    }

    /// Releases the next node, marking it running.
    ///
    /// Gates are released regardless of the bound. Otherwise, while fewer
    /// nodes are ready than there are free slots, nodes are released in
    /// arrival order; once the bound is reached the node that unblocks the
    /// most downstream work goes first, ties broken by arrival order.
    pub fn next_ready(&mut self) -> Option<StepId> {
        if self.halted {
            return None;
        }
        let cleanup_open = self.open_main == 0;
        let releasable =
            |entry: &Entry<T>| entry.phase == Phase::Main || cleanup_open;

        let gate = self
            .ready
            .iter()
            .copied()
            .find(|&id| !self.entries[id].limited && releasable(&self.entries[id]));
        if let Some(id) = gate {
            self.mark_running(id);
            return Some(id);
        }

        if self.running >= self.parallelism {
            return None;
        }
        let candidates: Vec<StepId> = self
            .ready
            .iter()
            .copied()
            .filter(|&id| releasable(&self.entries[id]))
            .collect();
        let slots = self.parallelism - self.running;
        let chosen = if candidates.len() <= slots {
            candidates.first().copied()
        } else {
            candidates
                .iter()
                .copied()
                .max_by_key(|&id| (self.descendants(id), Reverse(id)))
        };
        let chosen = chosen?;

        self.mark_running(chosen);
        Some(chosen)
    }

    fn mark_running(&mut self, id: StepId) {
        self.ready.remove(&id);
        let entry = &mut self.entries[id];
        entry.status = StepStatus::Running;
        if entry.limited {
            self.running += 1;
        }
    }

    /// Number of unfinished nodes that transitively wait on `id`.
    fn descendants(&self, id: StepId) -> usize {
        let mut seen = vec![false; self.entries.len()];
        let mut stack = vec![id];
        let mut count = 0;
        while let Some(current) = stack.pop() {
            for &dependent in &self.entries[current].dependents {
                if !seen[dependent] && !self.entries[dependent].status.is_terminal() {
                    seen[dependent] = true;
                    count += 1;
                    stack.push(dependent);
                }
            }
        }
        count
    }

    /// Marks a running node succeeded and readies the dependents it was
    /// the last blocker for.
    pub fn succeed(&mut self, id: StepId) {
        if !self.finish_running(id, StepStatus::Succeeded) {
            return;
        }
        let dependents = self.entries[id].dependents.clone();
        for dependent in dependents {
            let entry = &mut self.entries[dependent];
            if entry.status != StepStatus::Pending {
                continue;
            }
            entry.waiting = entry.waiting.saturating_sub(1);
            if entry.waiting == 0 {
                entry.status = StepStatus::Ready;
                self.ready.insert(dependent);
            }
        }
    }

    /// Marks a running node failed and skips everything that waits on it.
    ///
    /// Returns the skipped ids.
    pub fn fail(&mut self, id: StepId) -> Vec<StepId> {
        if !self.finish_running(id, StepStatus::Failed) {
            return Vec::new();
        }
        let dependents = self.entries[id].dependents.clone();
        dependents
            .into_iter()
            .flat_map(|dependent| self.skip_from(dependent, id))
            .collect()
    }

    fn finish_running(&mut self, id: StepId, status: StepStatus) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.status != StepStatus::Running {
            debug!("Node {} completed while {}", id, entry.status);
            return false;
        }
        entry.status = status;
        if entry.limited {
            self.running -= 1;
        }
        if entry.phase == Phase::Main {
            self.open_main -= 1;
        }
        true
    }

    /// Skips `start` (blocked by `cause`) and everything downstream of it.
    fn skip_from(&mut self, start: StepId, cause: StepId) -> Vec<StepId> {
        let mut skipped = Vec::new();
        let mut stack = vec![(start, cause)];
        while let Some((current, blocker)) = stack.pop() {
            if !matches!(
                self.entries[current].status,
                StepStatus::Pending | StepStatus::Ready
            ) {
                continue;
            }
            self.ready.remove(&current);
            let entry = &mut self.entries[current];
            entry.status = StepStatus::Skipped;
            entry.blocked_by = Some(blocker);
            if entry.phase == Phase::Main {
                self.open_main -= 1;
            }
            skipped.push(current);
            stack.extend(entry.dependents.iter().map(|&d| (d, current)));
        }
        skipped
    }

    /// Stops releasing nodes. Running nodes may still complete.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Returns true once [`halt`](Self::halt) has been called.
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted
    }

    /// Returns the number of nodes that are not terminal.
    #[must_use]
    pub fn unfinished(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    /// Closes the run: unreleased nodes become skipped and nodes still
    /// marked running become failed. Returns the skipped ids.
    pub fn finish(&mut self) -> Vec<StepId> {
        let mut skipped = Vec::new();
        for (id, entry) in self.entries.iter_mut().enumerate() {
            match entry.status {
                StepStatus::Pending | StepStatus::Ready => {
                    entry.status = StepStatus::Skipped;
                    skipped.push(id);
                }
                StepStatus::Running => entry.status = StepStatus::Failed,
                _ => {}
            }
        }
        self.ready.clear();
        self.running = 0;
        self.open_main = 0;
        skipped
    }

    /// Returns the status of a node.
    #[must_use]
    pub fn status(&self, id: StepId) -> Option<StepStatus> {
        self.entries.get(id).map(|e| e.status)
    }

    /// Returns the phase of a node.
    #[must_use]
    pub fn phase(&self, id: StepId) -> Option<Phase> {
        self.entries.get(id).map(|e| e.phase)
    }

    /// Returns the failed or skipped dependency that caused a skip.
    #[must_use]
    pub fn blocked_by(&self, id: StepId) -> Option<StepId> {
        self.entries.get(id).and_then(|e| e.blocked_by)
    }

    /// Returns a node's payload.
    #[must_use]
    pub fn payload(&self, id: StepId) -> Option<&T> {
        self.entries.get(id).map(|e| &e.payload)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no node was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
