// Copyright 2024 The MemShed Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use hashbrown::{HashMap, HashSet};
use tracing::{event, Level};

use crate::cluster_state::{ClusterStateImpl, TaskKey, TaskStage, TaskState, WorkerId, WorkerStatus};
use crate::policy::{Suggestion, SuggestionOp};

/// Planned replica changes for one task within one tick.
///
/// `pending_add` and `pending_remove` are always disjoint and a worker never
/// appears in both across the lifetime of the transaction.
#[derive(Debug, Default)]
pub struct TaskTransaction {
    pending_add: HashSet<WorkerId>,
    pending_remove: HashSet<WorkerId>,
}

impl TaskTransaction {
    pub fn pending_add(&self) -> &HashSet<WorkerId> {
        &self.pending_add
    }

    pub fn pending_remove(&self) -> &HashSet<WorkerId> {
        &self.pending_remove
    }
}

/// Accumulated decisions of one tick, plus the tick-start snapshot of every
/// worker's optimistic memory. Accepted suggestions adjust the snapshot by
/// the task's size so that successive placements within the same tick spread
/// across workers instead of piling onto the single coldest one.
#[derive(Debug, Default)]
pub struct Transaction {
    entries: HashMap<TaskKey, TaskTransaction>,
    workers_memory: HashMap<WorkerId, u64>,
}

impl Transaction {
    /// Starts an empty transaction, snapshotting every worker's optimistic
    /// memory from the given cluster view.
    pub fn new(cluster: &ClusterStateImpl) -> Self {
        Self {
            entries: HashMap::new(),
            workers_memory: cluster
                .workers
                .values()
                .map(|worker| (worker.id.clone(), worker.memory.optimistic))
                .collect(),
        }
    }

    pub fn pending(&self, key: &TaskKey) -> Option<&TaskTransaction> {
        self.entries.get(key)
    }

    pub fn has_pending_add(&self, key: &TaskKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.pending_add.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tasks with at least one planned change.
    pub fn task_count(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskKey, &TaskTransaction)> {
        self.entries.iter()
    }

    fn record_add(&mut self, key: &TaskKey, worker_id: WorkerId, nbytes: u64) {
        if let Some(memory) = self.workers_memory.get_mut(&worker_id) {
            *memory = memory.saturating_add(nbytes);
        }
        self.entries
            .entry(key.clone())
            .or_default()
            .pending_add
            .insert(worker_id);
    }

    fn record_remove(&mut self, key: &TaskKey, worker_id: WorkerId, nbytes: u64) {
        if let Some(memory) = self.workers_memory.get_mut(&worker_id) {
            *memory = memory.saturating_sub(nbytes);
        }
        self.entries
            .entry(key.clone())
            .or_default()
            .pending_remove
            .insert(worker_id);
    }

    fn adjusted_memory(&self, worker_id: &WorkerId) -> u64 {
        self.workers_memory.get(worker_id).copied().unwrap_or(0)
    }
}

/// Why a suggestion was not enacted. Rejections are DEBUG-logged and
/// reported to the suggesting policy as `None`; they are never errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RejectReason {
    UnknownTask,
    NotInMemory(TaskStage),
    LessThanTwoReplicas,
    NoCandidateHoldsKey,
    NoEligibleHolder,
    WaitersWouldBeStranded,
    AllCandidatesHoldKey,
    AllRecipientsPaused,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownTask => f.write_str("task no longer exists"),
            RejectReason::NotInMemory(stage) => write!(f, "task is in stage {stage}"),
            RejectReason::LessThanTwoReplicas => f.write_str("less than 2 replicas exist"),
            RejectReason::NoCandidateHoldsKey => f.write_str("no candidate holds the key"),
            RejectReason::NoEligibleHolder => f.write_str("no eligible holder"),
            RejectReason::WaitersWouldBeStranded => f.write_str("waiters would be stranded"),
            RejectReason::AllCandidatesHoldKey => f.write_str("all candidates hold the key"),
            RejectReason::AllRecipientsPaused => f.write_str("all recipients paused"),
        }
    }
}

/// The safety and selection core of the memory manager.
///
/// One arbiter is handed to each policy per tick. It validates suggestions
/// against the live cluster view and the decisions already accumulated this
/// tick, picks the concrete worker for each accepted suggestion, and records
/// it in the transaction. Guarantees upheld for every task:
///
/// * only tasks in memory are touched;
/// * the set of current holders minus planned drops never becomes empty;
/// * a task with executing dependents keeps a replica where they run, and is
///   never drained from its last running holder;
/// * replicas are never placed on workers that hold (or are about to hold)
///   the key, nor on paused or retiring workers;
/// * a worker appears at most once per task per tick.
pub struct SuggestionArbiter<'a> {
    cluster: &'a ClusterStateImpl,
    transaction: &'a mut Transaction,
    pub(crate) accepted: u64,
    pub(crate) rejected: u64,
}

impl<'a> SuggestionArbiter<'a> {
    pub fn new(cluster: &'a ClusterStateImpl, transaction: &'a mut Transaction) -> Self {
        Self {
            cluster,
            transaction,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Live, read-only view of the scheduler state.
    pub fn cluster(&self) -> &ClusterStateImpl {
        self.cluster
    }

    /// Read-only view of the decisions accumulated so far this tick.
    pub fn transaction(&self) -> &Transaction {
        self.transaction
    }

    /// Consumes one suggestion and returns the chosen worker, or `None` if
    /// the suggestion was rejected.
    pub fn suggest(&mut self, suggestion: Suggestion) -> Option<WorkerId> {
        if matches!(&suggestion.candidates, Some(c) if c.is_empty()) {
            // Explicitly empty candidates are the policy's "do nothing"
            // signal, distinct from None, and are not logged as rejections.
            return None;
        }
        let cluster = self.cluster;
        let result = match cluster.tasks.get(&suggestion.key) {
            None => Err(RejectReason::UnknownTask),
            Some(task) if task.stage != TaskStage::Memory => {
                Err(RejectReason::NotInMemory(task.stage))
            }
            Some(task) => match suggestion.op {
                SuggestionOp::Drop => self.pick_drop_source(task, suggestion.candidates.as_ref()),
                SuggestionOp::Replicate => {
                    self.pick_recipient(task, suggestion.candidates.as_ref())
                }
            },
        };
        match result {
            Ok(worker_id) => {
                self.accepted += 1;
                let nbytes = cluster.tasks.get(&suggestion.key).map_or(0, |t| t.nbytes);
                match suggestion.op {
                    SuggestionOp::Drop => {
                        event!(
                            Level::DEBUG,
                            key = %suggestion.key,
                            candidates = ?suggestion.candidates,
                            worker = %worker_id,
                            "(drop) dropping from worker",
                        );
                        self.transaction
                            .record_remove(&suggestion.key, worker_id.clone(), nbytes);
                    }
                    SuggestionOp::Replicate => {
                        event!(
                            Level::DEBUG,
                            key = %suggestion.key,
                            candidates = ?suggestion.candidates,
                            worker = %worker_id,
                            "(replicate) replicating to worker",
                        );
                        self.transaction
                            .record_add(&suggestion.key, worker_id.clone(), nbytes);
                    }
                }
                Some(worker_id)
            }
            Err(reason) => {
                self.rejected += 1;
                event!(
                    Level::DEBUG,
                    op = %suggestion.op,
                    key = %suggestion.key,
                    candidates = ?suggestion.candidates,
                    reason = %reason,
                    "Suggestion rejected",
                );
                None
            }
        }
    }

    fn pick_drop_source(
        &self,
        task: &TaskState,
        candidates: Option<&HashSet<WorkerId>>,
    ) -> Result<WorkerId, RejectReason> {
        let entry = self.transaction.pending(&task.key);
        let pending_remove_len = entry.map_or(0, |e| e.pending_remove.len());
        // Replicas still in flight (pending_add) cannot survive a drop, so
        // they don't count towards the survivor requirement. This also keeps
        // the dispatch source list non-empty.
        if task.who_has.len().saturating_sub(pending_remove_len) < 2 {
            return Err(RejectReason::LessThanTwoReplicas);
        }

        let mut pool: HashSet<WorkerId> = match candidates {
            Some(candidates) => {
                let pool: HashSet<WorkerId> =
                    candidates.intersection(&task.who_has).cloned().collect();
                if pool.is_empty() {
                    return Err(RejectReason::NoCandidateHoldsKey);
                }
                pool
            }
            None => task.who_has.clone(),
        };
        if let Some(entry) = entry {
            for worker_id in &entry.pending_remove {
                pool.remove(worker_id);
            }
            for worker_id in &entry.pending_add {
                pool.remove(worker_id);
            }
        }
        // A worker executing a dependent of this task has the replica
        // pinned; the worker would refuse the drop anyway.
        pool.retain(|worker_id| {
            self.cluster.workers.get(worker_id).is_some_and(|worker| {
                !task.waiters.iter().any(|waiter| worker.processing.contains(waiter))
            })
        });
        if pool.is_empty() {
            return Err(RejectReason::NoEligibleHolder);
        }

        // Paused and retiring holders are drained first.
        let chosen = self.max_by_adjusted_memory(
            pool.iter()
                .filter(|worker_id| !self.worker_is_running(worker_id)),
        );
        if let Some(worker_id) = chosen {
            return Ok(worker_id);
        }

        // The pool is all running. Don't take the last running replica away
        // from a task that still has unfinished dependents.
        if !task.waiters.is_empty() {
            let running_holders = task
                .who_has
                .iter()
                .filter(|worker_id| {
                    entry.map_or(true, |e| !e.pending_remove.contains(*worker_id))
                        && self.worker_is_running(worker_id)
                })
                .count();
            if running_holders <= 1 {
                return Err(RejectReason::WaitersWouldBeStranded);
            }
        }
        self.max_by_adjusted_memory(pool.iter())
            .ok_or(RejectReason::NoEligibleHolder)
    }

    fn pick_recipient(
        &self,
        task: &TaskState,
        candidates: Option<&HashSet<WorkerId>>,
    ) -> Result<WorkerId, RejectReason> {
        let mut pool: HashSet<WorkerId> = match candidates {
            Some(candidates) => candidates.clone(),
            None => self.cluster.workers.keys().cloned().collect(),
        };
        for worker_id in &task.who_has {
            pool.remove(worker_id);
        }
        if let Some(entry) = self.transaction.pending(&task.key) {
            for worker_id in &entry.pending_add {
                pool.remove(worker_id);
            }
            for worker_id in &entry.pending_remove {
                pool.remove(worker_id);
            }
        }
        if pool.is_empty() {
            return Err(RejectReason::AllCandidatesHoldKey);
        }
        pool.retain(|worker_id| self.worker_is_running(worker_id));
        if pool.is_empty() {
            return Err(RejectReason::AllRecipientsPaused);
        }
        self.min_by_adjusted_memory(pool.iter())
            .ok_or(RejectReason::AllRecipientsPaused)
    }

    fn worker_is_running(&self, worker_id: &WorkerId) -> bool {
        self.cluster
            .workers
            .get(worker_id)
            .is_some_and(|worker| worker.status == WorkerStatus::Running)
    }

    fn max_by_adjusted_memory<'w>(
        &self,
        workers: impl Iterator<Item = &'w WorkerId>,
    ) -> Option<WorkerId> {
        workers
            .max_by(|a, b| {
                self.transaction
                    .adjusted_memory(a)
                    .cmp(&self.transaction.adjusted_memory(b))
                    .then_with(|| a.cmp(b))
            })
            .cloned()
    }

    fn min_by_adjusted_memory<'w>(
        &self,
        workers: impl Iterator<Item = &'w WorkerId>,
    ) -> Option<WorkerId> {
        workers
            .min_by(|a, b| {
                self.transaction
                    .adjusted_memory(a)
                    .cmp(&self.transaction.adjusted_memory(b))
                    .then_with(|| a.cmp(b))
            })
            .cloned()
    }
}
