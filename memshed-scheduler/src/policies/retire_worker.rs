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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use memshed_error::Error;
use tracing::{event, Level};

use crate::cluster_state::{TaskKey, WorkerId, WorkerStatus};
use crate::policy::{MemoryPolicy, PolicyOutcome, Suggestion};
use crate::suggestion_arbiter::SuggestionArbiter;

/// Give up draining after this many consecutive ticks where none of the
/// worker's unique keys could find a replication recipient.
const MAX_FRUITLESS_TICKS: usize = 2;

/// Drains one worker that is being retired: replicates its unique keys onto
/// running workers and drops everything else from it. Installed by
/// `retire_workers`, one instance per target; self-removes when the target
/// leaves the cluster or when no recipient can be found for its data.
pub struct RetireWorker {
    target: WorkerId,
    /// Set when draining is abandoned because no running worker could
    /// receive the target's unique keys. The retirement workflow polls this.
    no_recipients: Arc<AtomicBool>,
    fruitless_ticks: usize,
}

impl RetireWorker {
    pub fn new(target: WorkerId, no_recipients: Arc<AtomicBool>) -> Self {
        Self {
            target,
            no_recipients,
            fruitless_ticks: 0,
        }
    }
}

impl MemoryPolicy for RetireWorker {
    fn name(&self) -> &'static str {
        "RetireWorker"
    }

    fn run(&mut self, amm: &mut SuggestionArbiter<'_>) -> Result<PolicyOutcome, Error> {
        // (key, has another replica on a running worker)
        let plan: Vec<(TaskKey, bool)> = {
            let cluster = amm.cluster();
            let Some(target) = cluster.workers.get(&self.target) else {
                event!(
                    Level::DEBUG,
                    worker = %self.target,
                    "Removing retirement policy, worker no longer in cluster",
                );
                return Ok(PolicyOutcome::Remove);
            };
            target
                .has_what
                .iter()
                .map(|key| {
                    let replicated_elsewhere = cluster.tasks.get(key).is_some_and(|task| {
                        task.who_has.iter().any(|holder| {
                            *holder != self.target
                                && cluster
                                    .workers
                                    .get(holder)
                                    .is_some_and(|w| w.status == WorkerStatus::Running)
                        })
                    });
                    (key.clone(), replicated_elsewhere)
                })
                .collect()
        };

        let mut unique_keys = 0usize;
        let mut without_recipient = 0usize;
        for (key, replicated_elsewhere) in plan {
            if !replicated_elsewhere {
                unique_keys += 1;
                // Another policy (or an earlier key pass) may have already
                // scheduled a copy; don't double-replicate or miscount that
                // as a failure.
                if !amm.transaction().has_pending_add(&key) {
                    let recipient = amm.suggest(Suggestion::replicate(key.clone(), None));
                    if recipient.is_none() {
                        without_recipient += 1;
                    }
                }
            }
            // The drop is rejected this tick while the key is unique; it
            // lands on a later tick once the replica exists elsewhere.
            let candidates: HashSet<WorkerId> = [self.target.clone()].into_iter().collect();
            amm.suggest(Suggestion::drop(key, Some(candidates)));
        }

        if unique_keys > 0 && without_recipient == unique_keys {
            self.fruitless_ticks += 1;
            if self.fruitless_ticks >= MAX_FRUITLESS_TICKS {
                event!(
                    Level::WARN,
                    worker = %self.target,
                    unique_keys,
                    "Tried retiring worker, but no running workers can receive its unique keys; giving up",
                );
                self.no_recipients.store(true, Ordering::Release);
                return Ok(PolicyOutcome::Remove);
            }
        } else {
            self.fruitless_ticks = 0;
        }
        Ok(PolicyOutcome::Retain)
    }
}
