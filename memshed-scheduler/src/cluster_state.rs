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
use memshed_error::{error_if, make_input_err, Error};
use parking_lot::{Mutex, MutexGuard};

/// Key of a task, unique within a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Address of a worker. The lexicographic order of addresses is the
/// deterministic tie-breaker used whenever two workers rank equally.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

/// Coarse lifecycle stage of a task. Only `Memory` tasks hold replicas that
/// can be dropped or copied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStage {
    Queued,
    Processing,
    Memory,
    Released,
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskStage::Queued => "queued",
            TaskStage::Processing => "processing",
            TaskStage::Memory => "memory",
            TaskStage::Released => "released",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    Running,
    /// Temporarily refusing new work, usually due to memory pressure.
    Paused,
    /// Being drained by the retirement workflow; its replicas must migrate
    /// before it leaves the cluster.
    ClosingGracefully,
    Closed,
}

/// Memory figures reported by a worker's latest heartbeat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerMemory {
    /// Resident process memory.
    pub process: u64,
    /// Projection of `process` that also accounts for incoming in-flight
    /// transfers. This is the figure replica placement ranks by.
    pub optimistic: u64,
}

impl WorkerMemory {
    pub fn new(optimistic: u64) -> Self {
        Self {
            process: optimistic,
            optimistic,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskState {
    pub key: TaskKey,
    pub stage: TaskStage,
    pub nbytes: u64,
    /// Workers currently holding the in-memory result.
    pub who_has: HashSet<WorkerId>,
    /// Dependent tasks that have not finished yet.
    pub waiters: HashSet<TaskKey>,
    /// Tasks whose results this task consumes.
    pub dependencies: HashSet<TaskKey>,
}

impl TaskState {
    pub fn new(key: impl Into<TaskKey>, nbytes: u64) -> Self {
        Self {
            key: key.into(),
            stage: TaskStage::Queued,
            nbytes,
            who_has: HashSet::new(),
            waiters: HashSet::new(),
            dependencies: HashSet::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerState {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub memory: WorkerMemory,
    /// Keys this worker holds in memory.
    pub has_what: HashSet<TaskKey>,
    /// Keys of tasks currently executing on this worker. Their dependencies
    /// are pinned: the worker refuses to drop replicas they consume.
    pub processing: HashSet<TaskKey>,
}

impl WorkerState {
    pub fn new(id: impl Into<WorkerId>) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Running,
            memory: WorkerMemory::default(),
            has_what: HashSet::new(),
            processing: HashSet::new(),
        }
    }
}

/// The scheduler's view of tasks and workers, shared between the scheduler
/// proper, the active memory manager, and the retirement workflow.
///
/// The memory manager only ever reads this store during a tick; replica
/// changes it suggests come back through the mutation API below when workers
/// report them.
pub struct ClusterState {
    inner: Mutex<ClusterStateImpl>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClusterStateImpl {
                tasks: HashMap::new(),
                workers: HashMap::new(),
            }),
        }
    }

    /// Locks the store for the duration of the returned guard. Memory
    /// manager ticks hold this lock for their whole synchronous body, which
    /// is what gives policies a consistent instantaneous view.
    pub fn lock(&self) -> MutexGuard<'_, ClusterStateImpl> {
        self.inner.lock()
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ClusterStateImpl {
    pub tasks: HashMap<TaskKey, TaskState>,
    pub workers: HashMap<WorkerId, WorkerState>,
}

impl ClusterStateImpl {
    pub fn add_worker(&mut self, worker: WorkerState) -> Result<(), Error> {
        error_if!(
            self.workers.contains_key(&worker.id),
            "Worker {} is already registered",
            worker.id
        );
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    /// Deregisters a worker and scrubs it from every task's holder set. A
    /// task losing its last replica degrades to `Released`.
    pub fn remove_worker(&mut self, worker_id: &WorkerId) -> Option<WorkerState> {
        let worker = self.workers.remove(worker_id)?;
        for key in &worker.has_what {
            if let Some(task) = self.tasks.get_mut(key) {
                task.who_has.remove(worker_id);
                if task.who_has.is_empty() && task.stage == TaskStage::Memory {
                    task.stage = TaskStage::Released;
                }
            }
        }
        Some(worker)
    }

    pub fn set_worker_status(
        &mut self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), Error> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| make_input_err!("Worker {worker_id} doesn't exist in the pool"))?;
        worker.status = status;
        Ok(())
    }

    pub fn set_worker_memory(
        &mut self,
        worker_id: &WorkerId,
        memory: WorkerMemory,
    ) -> Result<(), Error> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| make_input_err!("Worker {worker_id} doesn't exist in the pool"))?;
        worker.memory = memory;
        Ok(())
    }

    /// Registers a task, wiring `waiters` edges on its dependencies and
    /// `has_what` entries for any holders it already lists.
    pub fn add_task(&mut self, task: TaskState) -> Result<(), Error> {
        error_if!(
            self.tasks.contains_key(&task.key),
            "Task {} is already registered",
            task.key
        );
        for dep_key in &task.dependencies {
            let dep = self
                .tasks
                .get_mut(dep_key)
                .ok_or_else(|| make_input_err!("Dependency {dep_key} of {} is unknown", task.key))?;
            dep.waiters.insert(task.key.clone());
        }
        for worker_id in &task.who_has {
            let worker = self
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| make_input_err!("Holder {worker_id} of {} is unknown", task.key))?;
            worker.has_what.insert(task.key.clone());
        }
        self.tasks.insert(task.key.clone(), task);
        Ok(())
    }

    /// Records that `worker_id` now holds a replica of `key`, eg: after an
    /// acquire-replicas round trip.
    pub fn add_replica(&mut self, key: &TaskKey, worker_id: &WorkerId) -> Result<(), Error> {
        let task = self
            .tasks
            .get_mut(key)
            .ok_or_else(|| make_input_err!("Task {key} is unknown"))?;
        error_if!(
            task.stage != TaskStage::Memory,
            "Task {key} is in stage {} and cannot gain replicas",
            task.stage
        );
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| make_input_err!("Worker {worker_id} doesn't exist in the pool"))?;
        task.who_has.insert(worker_id.clone());
        worker.has_what.insert(key.clone());
        Ok(())
    }

    /// Records that `worker_id` no longer holds a replica of `key`.
    pub fn remove_replica(&mut self, key: &TaskKey, worker_id: &WorkerId) -> Result<(), Error> {
        let task = self
            .tasks
            .get_mut(key)
            .ok_or_else(|| make_input_err!("Task {key} is unknown"))?;
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| make_input_err!("Worker {worker_id} doesn't exist in the pool"))?;
        task.who_has.remove(worker_id);
        worker.has_what.remove(key);
        if task.who_has.is_empty() && task.stage == TaskStage::Memory {
            task.stage = TaskStage::Released;
        }
        Ok(())
    }

    /// Marks a task as executing on a worker.
    pub fn start_processing(&mut self, key: &TaskKey, worker_id: &WorkerId) -> Result<(), Error> {
        let task = self
            .tasks
            .get_mut(key)
            .ok_or_else(|| make_input_err!("Task {key} is unknown"))?;
        task.stage = TaskStage::Processing;
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| make_input_err!("Worker {worker_id} doesn't exist in the pool"))?;
        worker.processing.insert(key.clone());
        Ok(())
    }

    /// Completes a task on a worker: the result lands in the worker's
    /// memory and the task stops waiting on its dependencies.
    pub fn finish_processing(&mut self, key: &TaskKey, worker_id: &WorkerId) -> Result<(), Error> {
        {
            let task = self
                .tasks
                .get_mut(key)
                .ok_or_else(|| make_input_err!("Task {key} is unknown"))?;
            task.stage = TaskStage::Memory;
            task.who_has.insert(worker_id.clone());
        }
        let dependencies = self
            .tasks
            .get(key)
            .map(|task| task.dependencies.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for dep_key in dependencies {
            if let Some(dep) = self.tasks.get_mut(&dep_key) {
                dep.waiters.remove(key);
            }
        }
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| make_input_err!("Worker {worker_id} doesn't exist in the pool"))?;
        worker.processing.remove(key);
        worker.has_what.insert(key.clone());
        Ok(())
    }
}
