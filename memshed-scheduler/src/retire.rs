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
use std::time::Duration;

use hashbrown::HashSet;
use memshed_error::{Error, ResultExt};
use tracing::{event, Level};

use crate::active_memory_manager::ActiveMemoryManager;
use crate::cluster_state::{WorkerId, WorkerStatus};
use crate::policies::RetireWorker;
use crate::policy::PolicyId;

const RETIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct RetireTarget {
    worker_id: WorkerId,
    prev_status: WorkerStatus,
    policy_id: PolicyId,
    no_recipients: Arc<AtomicBool>,
}

impl ActiveMemoryManager {
    /// Gracefully retires workers: marks each one `ClosingGracefully`,
    /// installs a [`RetireWorker`] policy for it, and waits until its data
    /// has migrated to other workers.
    ///
    /// On success the target is deregistered from the cluster when `remove`
    /// is set and asked to shut down when `close_workers` is set. A worker
    /// whose unique keys cannot be replicated anywhere (every other worker
    /// paused or retiring) is restored to its previous status and left out
    /// of the returned set.
    ///
    /// Returns the addresses that actually retired, a subset of the input.
    pub async fn retire_workers(
        &self,
        addrs: impl IntoIterator<Item = WorkerId>,
        close_workers: bool,
        remove: bool,
    ) -> Result<HashSet<WorkerId>, Error> {
        let mut targets: Vec<RetireTarget> = vec![];
        {
            // Install everything under the tick mutex so the first tick
            // sees the whole batch at once.
            let mut registry = self.shared().policies.lock().await;
            let mut cluster = self.shared().cluster.lock();
            for worker_id in addrs {
                let Some(worker) = cluster.workers.get_mut(&worker_id) else {
                    event!(Level::WARN, worker = %worker_id, "Cannot retire unknown worker");
                    continue;
                };
                let prev_status = worker.status;
                worker.status = WorkerStatus::ClosingGracefully;
                let no_recipients = Arc::new(AtomicBool::new(false));
                let policy_id = registry.insert(Box::new(RetireWorker::new(
                    worker_id.clone(),
                    no_recipients.clone(),
                )));
                event!(Level::INFO, worker = %worker_id, "Retiring worker");
                targets.push(RetireTarget {
                    worker_id,
                    prev_status,
                    policy_id,
                    no_recipients,
                });
            }
        }
        if targets.is_empty() {
            return Ok(HashSet::new());
        }

        // Keep ticks flowing while we wait, even with the manager stopped.
        // The guard aborts the private ticker when this call returns.
        let _ticker_guard = if self.running() {
            None
        } else {
            Some(ActiveMemoryManager::spawn_ticker(self.shared()))
        };
        // Kick a tick right away rather than waiting out the interval.
        self.run_once().await;

        let results = futures::future::join_all(
            targets
                .into_iter()
                .map(|target| self.track_retirement(target, close_workers, remove)),
        )
        .await;
        let mut retired = HashSet::new();
        for result in results {
            if let Some(worker_id) = result? {
                retired.insert(worker_id);
            }
        }
        Ok(retired)
    }

    /// Waits for one retirement target to drain, give up, or disappear.
    async fn track_retirement(
        &self,
        target: RetireTarget,
        close_workers: bool,
        remove: bool,
    ) -> Result<Option<WorkerId>, Error> {
        loop {
            {
                let cluster = self.shared().cluster.lock();
                match cluster.workers.get(&target.worker_id) {
                    // Already gone, eg: evicted by the worker TTL. Treat as
                    // retired; there is nothing left to drain.
                    None => break,
                    Some(worker) if worker.has_what.is_empty() => break,
                    Some(_) => {}
                }
            }
            if target.no_recipients.load(Ordering::Acquire) {
                self.metrics().retire_give_ups.inc();
                {
                    let mut cluster = self.shared().cluster.lock();
                    if cluster.workers.contains_key(&target.worker_id) {
                        cluster
                            .set_worker_status(&target.worker_id, target.prev_status)
                            .err_tip(|| "While abandoning worker retirement")?;
                    }
                }
                event!(
                    Level::WARN,
                    worker = %target.worker_id,
                    "Worker was not retired; no suitable recipients for its data",
                );
                return Ok(None);
            }
            tokio::time::sleep(RETIRE_POLL_INTERVAL).await;
        }

        // The policy normally removed itself only if the worker vanished;
        // drop it explicitly for the drained case.
        self.remove_policy(target.policy_id).await;
        if remove {
            self.shared().cluster.lock().remove_worker(&target.worker_id);
        }
        if close_workers {
            if let Err(err) = self
                .shared()
                .worker_api
                .close_worker(&target.worker_id)
                .await
            {
                event!(
                    Level::WARN,
                    worker = %target.worker_id,
                    ?err,
                    "Failed to close retired worker",
                );
            }
        }
        self.metrics().workers_retired.inc();
        event!(
            Level::INFO,
            worker = %target.worker_id,
            "Worker retired; its data has been replicated elsewhere",
        );
        Ok(Some(target.worker_id))
    }
}
