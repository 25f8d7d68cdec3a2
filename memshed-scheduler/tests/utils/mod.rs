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

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use memshed_error::{make_err, Code, Error, ResultExt};
use memshed_scheduler::active_memory_manager::ActiveMemoryManager;
use memshed_scheduler::cluster_state::{
    ClusterState, TaskKey, TaskStage, TaskState, WorkerId, WorkerMemory, WorkerState, WorkerStatus,
};
use memshed_scheduler::policy::{MemoryPolicy, PolicyOutcome, Suggestion, SuggestionOp};
use memshed_scheduler::suggestion_arbiter::SuggestionArbiter;
use memshed_scheduler::worker_api::WorkerApi;
use parking_lot::Mutex;

pub fn init_tracing() {
    memshed_util::logging::init_tracing();
}

/// Builds a cluster store with the given running workers, all reporting the
/// same memory figures.
pub fn cluster_with_workers(addresses: &[&str]) -> Arc<ClusterState> {
    let cluster = Arc::new(ClusterState::new());
    {
        let mut state = cluster.lock();
        for address in addresses {
            state.add_worker(WorkerState::new(*address)).unwrap();
        }
    }
    cluster
}

/// Registers a task already in memory on the given holders.
pub fn add_memory_task(cluster: &ClusterState, key: &str, nbytes: u64, holders: &[&str]) {
    let mut state = cluster.lock();
    let mut task = TaskState::new(key, nbytes);
    task.stage = TaskStage::Memory;
    task.who_has = holders.iter().map(|h| WorkerId::from(*h)).collect();
    state.add_task(task).unwrap();
}

/// Registers a task that depends on `dependency` and is executing on
/// `worker`, making `worker` a pinned holder of the dependency.
pub fn add_executing_waiter(cluster: &ClusterState, key: &str, dependency: &str, worker: &str) {
    let mut state = cluster.lock();
    let mut task = TaskState::new(key, 0);
    task.dependencies = [TaskKey::from(dependency)].into_iter().collect();
    state.add_task(task).unwrap();
    state
        .start_processing(&TaskKey::from(key), &WorkerId::from(worker))
        .unwrap();
}

pub fn who_has(cluster: &ClusterState, key: &str) -> HashSet<WorkerId> {
    cluster
        .lock()
        .tasks
        .get(&TaskKey::from(key))
        .map(|task| task.who_has.clone())
        .unwrap_or_default()
}

pub fn worker_ids(addresses: &[&str]) -> HashSet<WorkerId> {
    addresses.iter().map(|a| WorkerId::from(*a)).collect()
}

pub fn set_optimistic_memory(cluster: &ClusterState, address: &str, optimistic: u64) {
    cluster
        .lock()
        .set_worker_memory(&WorkerId::from(address), WorkerMemory::new(optimistic))
        .unwrap();
}

pub fn set_status(cluster: &ClusterState, address: &str, status: WorkerStatus) {
    cluster
        .lock()
        .set_worker_status(&WorkerId::from(address), status)
        .unwrap();
}

/// A manager with a short tick interval, suitable for tests.
pub fn test_manager(
    cluster: &Arc<ClusterState>,
    api: &Arc<MockWorkerApi>,
    policies: Vec<Box<dyn MemoryPolicy>>,
) -> ActiveMemoryManager {
    ActiveMemoryManager::with_policies(
        cluster.clone(),
        api.clone(),
        Duration::from_millis(20),
        policies,
    )
}

/// Polls `cond` until it holds, panicking after a generous timeout.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition was not reached in time");
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcCall {
    Acquire {
        worker: WorkerId,
        keys: Vec<TaskKey>,
    },
    Remove {
        worker: WorkerId,
        keys: Vec<TaskKey>,
    },
    Close {
        worker: WorkerId,
    },
}

/// A worker API that enacts accepted suggestions straight back onto the
/// cluster store, standing in for the worker -> scheduler status roundtrip.
/// Workers listed in `offline` fail every call, like a dead host would.
pub struct MockWorkerApi {
    cluster: Arc<ClusterState>,
    pub offline: Mutex<HashSet<WorkerId>>,
    pub calls: Mutex<Vec<RpcCall>>,
}

impl MockWorkerApi {
    pub fn new(cluster: Arc<ClusterState>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            offline: Mutex::new(HashSet::new()),
            calls: Mutex::new(vec![]),
        })
    }

    pub fn set_offline(&self, address: &str) {
        self.offline.lock().insert(WorkerId::from(address));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn check_online(&self, worker: &WorkerId) -> Result<(), Error> {
        if self.offline.lock().contains(worker) {
            return Err(make_err!(Code::Unavailable, "Worker {worker} is unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerApi for MockWorkerApi {
    async fn acquire_replicas(
        &self,
        worker: &WorkerId,
        keys_with_sources: HashMap<TaskKey, Vec<WorkerId>>,
    ) -> Result<(), Error> {
        self.calls.lock().push(RpcCall::Acquire {
            worker: worker.clone(),
            keys: {
                let mut keys: Vec<TaskKey> = keys_with_sources.keys().cloned().collect();
                keys.sort();
                keys
            },
        });
        self.check_online(worker)?;
        let offline = self.offline.lock().clone();
        let mut state = self.cluster.lock();
        for (key, sources) in keys_with_sources {
            // A transfer needs at least one reachable source.
            if sources.iter().all(|source| offline.contains(source)) {
                continue;
            }
            if state.tasks.contains_key(&key) && state.workers.contains_key(worker) {
                state
                    .add_replica(&key, worker)
                    .err_tip(|| "In MockWorkerApi::acquire_replicas")?;
            }
        }
        Ok(())
    }

    async fn remove_replicas(&self, worker: &WorkerId, keys: Vec<TaskKey>) -> Result<(), Error> {
        self.calls.lock().push(RpcCall::Remove {
            worker: worker.clone(),
            keys: keys.clone(),
        });
        self.check_online(worker)?;
        let mut state = self.cluster.lock();
        for key in keys {
            // The worker refuses to drop a key an executing task consumes.
            let in_use = state.workers.get(worker).is_some_and(|ws| {
                ws.processing.iter().any(|running| {
                    state
                        .tasks
                        .get(running)
                        .is_some_and(|task| task.dependencies.contains(&key))
                })
            });
            if in_use {
                continue;
            }
            if state.tasks.contains_key(&key) && state.workers.contains_key(worker) {
                state
                    .remove_replica(&key, worker)
                    .err_tip(|| "In MockWorkerApi::remove_replicas")?;
            }
        }
        Ok(())
    }

    async fn close_worker(&self, worker: &WorkerId) -> Result<(), Error> {
        self.calls.lock().push(RpcCall::Close {
            worker: worker.clone(),
        });
        self.check_online(worker)
    }
}

/// Suggests dropping or replicating one key `n` times per tick, optionally
/// restricted to a fixed candidate set. The arbiter is expected to reject
/// whatever is unsafe.
pub struct DemoPolicy {
    pub op: SuggestionOp,
    pub key: TaskKey,
    pub n: usize,
    pub candidates: Option<Vec<WorkerId>>,
}

impl DemoPolicy {
    pub fn drop(key: &str, n: usize, candidates: Option<&[&str]>) -> Box<Self> {
        Box::new(Self {
            op: SuggestionOp::Drop,
            key: TaskKey::from(key),
            n,
            candidates: candidates.map(|c| c.iter().map(|a| WorkerId::from(*a)).collect()),
        })
    }

    pub fn replicate(key: &str, n: usize, candidates: Option<&[&str]>) -> Box<Self> {
        Box::new(Self {
            op: SuggestionOp::Replicate,
            key: TaskKey::from(key),
            n,
            candidates: candidates.map(|c| c.iter().map(|a| WorkerId::from(*a)).collect()),
        })
    }
}

impl MemoryPolicy for DemoPolicy {
    fn name(&self) -> &'static str {
        "DemoPolicy"
    }

    fn run(&mut self, amm: &mut SuggestionArbiter<'_>) -> Result<PolicyOutcome, Error> {
        for _ in 0..self.n {
            amm.suggest(Suggestion {
                op: self.op,
                key: self.key.clone(),
                candidates: self
                    .candidates
                    .as_ref()
                    .map(|c| c.iter().cloned().collect()),
            });
        }
        Ok(PolicyOutcome::Retain)
    }
}
