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

use memshed_config::ReduceReplicasConfig;
use memshed_error::Error;
use tracing::{event, Level};

use crate::cluster_state::{TaskKey, TaskStage};
use crate::policy::{MemoryPolicy, PolicyOutcome, Suggestion};
use crate::suggestion_arbiter::SuggestionArbiter;

/// Drops superfluous replicas: for every task held in memory by more than
/// one worker, suggests trimming down to a single copy. The arbiter still
/// protects the last replica and replicas pinned by executing dependents.
pub struct ReduceReplicas;

impl ReduceReplicas {
    pub fn new(_config: &ReduceReplicasConfig) -> Self {
        Self
    }
}

impl MemoryPolicy for ReduceReplicas {
    fn name(&self) -> &'static str {
        "ReduceReplicas"
    }

    fn run(&mut self, amm: &mut SuggestionArbiter<'_>) -> Result<PolicyOutcome, Error> {
        // Snapshot the work list first; drops already planned this tick
        // (eg: by another instance of this policy) reduce the surplus, which
        // keeps a second pass deterministically quiet.
        let todo: Vec<(TaskKey, usize)> = amm
            .cluster()
            .tasks
            .values()
            .filter(|task| task.stage == TaskStage::Memory)
            .filter_map(|task| {
                let planned_drops = amm
                    .transaction()
                    .pending(&task.key)
                    .map_or(0, |entry| entry.pending_remove().len());
                let surplus = task
                    .who_has
                    .len()
                    .saturating_sub(planned_drops)
                    .saturating_sub(1);
                (surplus > 0).then(|| (task.key.clone(), surplus))
            })
            .collect();

        let mut dropped = 0usize;
        let mut affected_tasks = 0usize;
        for (key, surplus) in todo {
            let mut dropped_for_key = 0usize;
            for _ in 0..surplus {
                if amm.suggest(Suggestion::drop(key.clone(), None)).is_some() {
                    dropped_for_key += 1;
                }
            }
            if dropped_for_key > 0 {
                dropped += dropped_for_key;
                affected_tasks += 1;
            }
        }
        if dropped > 0 {
            event!(
                Level::DEBUG,
                replicas = dropped,
                tasks = affected_tasks,
                "Dropping {dropped} superfluous replicas of {affected_tasks} tasks",
            );
        }
        Ok(PolicyOutcome::Retain)
    }
}
