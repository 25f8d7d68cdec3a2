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

use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use hashbrown::HashMap;
use memshed_config::{ActiveMemoryManagerConfig, PolicyConfig};
use memshed_error::{error_if, Error};
use memshed_util::metrics_utils::{AsyncCounterWrapper, CounterWithTime};
use memshed_util::task::JoinHandleDropGuard;
use memshed_util::{background_spawn, spawn};
use tokio::time::MissedTickBehavior;
use tracing::{event, Level};

use crate::cluster_state::{ClusterState, TaskKey, WorkerId};
use crate::policies::ReduceReplicas;
use crate::policy::{MemoryPolicy, PolicyId, PolicyOutcome};
use crate::suggestion_arbiter::{SuggestionArbiter, Transaction};
use crate::worker_api::WorkerApi;

/// The active memory manager scheduler extension.
///
/// Owns a set of policies and periodically lets each one suggest replica
/// drops and replications, which the suggestion arbiter merges into one safe
/// per-tick transaction that is then dispatched to workers. The extension
/// never mutates the cluster state itself; enacted changes flow back through
/// normal worker status updates.
///
/// Multiple managers may coexist against the same cluster store, each with
/// its own policy set and timer.
pub struct ActiveMemoryManager {
    shared: Arc<AmmShared>,
    ticker: parking_lot::Mutex<Option<JoinHandleDropGuard<()>>>,
}

impl ActiveMemoryManager {
    /// Builds a manager from configuration and auto-starts it when
    /// `config.start` is set. Must be called within a tokio runtime.
    pub fn new(
        cluster: Arc<ClusterState>,
        worker_api: Arc<dyn WorkerApi>,
        config: &ActiveMemoryManagerConfig,
    ) -> Result<Self, Error> {
        error_if!(
            config.interval.is_zero(),
            "active-memory-manager interval must be greater than zero"
        );
        let policies = config
            .policies
            .iter()
            .map(|policy_config| match policy_config {
                PolicyConfig::reduce_replicas(config) => {
                    Box::new(ReduceReplicas::new(config)) as Box<dyn MemoryPolicy>
                }
            })
            .collect();
        let manager = Self::with_policies(cluster, worker_api, config.interval, policies);
        if config.start {
            manager.start();
        }
        Ok(manager)
    }

    pub fn with_policies(
        cluster: Arc<ClusterState>,
        worker_api: Arc<dyn WorkerApi>,
        interval: Duration,
        policies: Vec<Box<dyn MemoryPolicy>>,
    ) -> Self {
        let mut registry = PolicyRegistry {
            next_id: 1,
            entries: vec![],
        };
        for policy in policies {
            registry.insert(policy);
        }
        Self {
            shared: Arc::new(AmmShared {
                cluster,
                worker_api,
                interval,
                policies: Mutex::new(registry),
                metrics: AmmMetrics::default(),
            }),
            ticker: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the periodic tick. Idempotent.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            event!(Level::DEBUG, "Active memory manager already running");
            return;
        }
        *ticker = Some(Self::spawn_ticker(&self.shared));
    }

    /// Cancels the periodic tick. Idempotent. An in-flight tick runs its
    /// synchronous body and dispatch to completion before the task unwinds.
    pub fn stop(&self) {
        self.ticker.lock().take();
    }

    pub fn running(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// Runs a single tick, whether or not the periodic timer is active.
    /// Concurrent calls serialize on the tick mutex.
    pub async fn run_once(&self) {
        AmmShared::run_once(&self.shared).await;
    }

    /// Installs a policy. It becomes eligible starting with the next tick.
    pub async fn add_policy(&self, policy: Box<dyn MemoryPolicy>) -> PolicyId {
        self.shared.policies.lock().await.insert(policy)
    }

    /// Uninstalls a policy. Returns false if it was already gone (eg: it
    /// removed itself).
    pub async fn remove_policy(&self, policy_id: PolicyId) -> bool {
        let mut registry = self.shared.policies.lock().await;
        let before = registry.entries.len();
        registry.entries.retain(|(id, _)| *id != policy_id);
        registry.entries.len() != before
    }

    pub async fn policy_count(&self) -> usize {
        self.shared.policies.lock().await.entries.len()
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.shared.cluster
    }

    pub fn metrics(&self) -> &AmmMetrics {
        &self.shared.metrics
    }

    pub(crate) fn shared(&self) -> &Arc<AmmShared> {
        &self.shared
    }

    pub(crate) fn spawn_ticker(shared: &Arc<AmmShared>) -> JoinHandleDropGuard<()> {
        let weak_shared = Arc::downgrade(shared);
        let period = shared.interval;
        spawn!("amm_ticker", async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Break out of the loop only when the manager is dropped.
            loop {
                interval.tick().await;
                match weak_shared.upgrade() {
                    Some(shared) => AmmShared::run_once(&shared).await,
                    None => return,
                }
            }
        })
    }
}

pub(crate) struct AmmShared {
    pub(crate) cluster: Arc<ClusterState>,
    pub(crate) worker_api: Arc<dyn WorkerApi>,
    pub(crate) interval: Duration,
    pub(crate) policies: Mutex<PolicyRegistry>,
    pub(crate) metrics: AmmMetrics,
}

pub(crate) struct PolicyRegistry {
    next_id: u64,
    /// Insertion-ordered; the order policies run in is observable.
    pub(crate) entries: Vec<(PolicyId, Box<dyn MemoryPolicy>)>,
}

impl PolicyRegistry {
    pub(crate) fn insert(&mut self, policy: Box<dyn MemoryPolicy>) -> PolicyId {
        let policy_id = PolicyId(self.next_id);
        self.next_id += 1;
        self.entries.push((policy_id, policy));
        policy_id
    }
}

impl AmmShared {
    pub(crate) async fn run_once(shared: &Arc<Self>) {
        let timer = shared.metrics.run_once.begin_timer();
        // The tick mutex both serializes run_once callers and keeps the
        // periodic timer from overlapping a manual tick.
        let mut registry = shared.policies.lock().await;
        let mut acquire_by_worker: HashMap<WorkerId, HashMap<TaskKey, Vec<WorkerId>>> =
            HashMap::new();
        let mut drop_by_worker: HashMap<WorkerId, Vec<TaskKey>> = HashMap::new();
        let task_count;
        {
            // Policies and the arbiter run synchronously under the cluster
            // lock and therefore observe one consistent snapshot.
            let cluster = shared.cluster.lock();
            let mut transaction = Transaction::new(&cluster);
            let mut removals: Vec<PolicyId> = vec![];
            for (policy_id, policy) in registry.entries.iter_mut() {
                event!(Level::DEBUG, policy = policy.name(), "Running policy");
                let mut arbiter = SuggestionArbiter::new(&cluster, &mut transaction);
                let outcome = policy.run(&mut arbiter);
                shared.metrics.suggestions_accepted.add(arbiter.accepted);
                shared.metrics.suggestions_rejected.add(arbiter.rejected);
                match outcome {
                    Ok(PolicyOutcome::Retain) => {}
                    Ok(PolicyOutcome::Remove) => removals.push(*policy_id),
                    Err(err) => {
                        shared.metrics.policy_errors.inc();
                        event!(
                            Level::ERROR,
                            policy = policy.name(),
                            ?err,
                            "Policy failed; skipping it for the remainder of this tick",
                        );
                    }
                }
            }
            registry
                .entries
                .retain(|(policy_id, _)| !removals.contains(policy_id));

            task_count = transaction.task_count();
            for (key, entry) in transaction.iter() {
                let Some(task) = cluster.tasks.get(key) else {
                    continue;
                };
                if !entry.pending_add().is_empty() {
                    let mut sources: Vec<WorkerId> = task
                        .who_has
                        .iter()
                        .filter(|worker_id| !entry.pending_remove().contains(*worker_id))
                        .cloned()
                        .collect();
                    sources.sort();
                    if sources.is_empty() {
                        // The arbiter never drains all current holders of a
                        // task it is also replicating.
                        event!(
                            Level::ERROR,
                            key = %key,
                            "No sources left to replicate from; skipping",
                        );
                        continue;
                    }
                    for recipient in entry.pending_add() {
                        acquire_by_worker
                            .entry(recipient.clone())
                            .or_default()
                            .insert(key.clone(), sources.clone());
                    }
                }
                for source in entry.pending_remove() {
                    drop_by_worker
                        .entry(source.clone())
                        .or_default()
                        .push(key.clone());
                }
            }
        }

        if task_count > 0 {
            event!(
                Level::DEBUG,
                tasks = task_count,
                "Enacting suggestions for {task_count} tasks",
            );
        }
        // Dispatch is fire and forget; a failed worker call is only logged.
        // If the cluster still warrants the change, the next tick produces a
        // fresh suggestion from fresh state.
        for (worker_id, keys_with_sources) in acquire_by_worker {
            let shared = shared.clone();
            background_spawn!("amm_acquire_replicas", async move {
                if let Err(err) = shared
                    .worker_api
                    .acquire_replicas(&worker_id, keys_with_sources)
                    .await
                {
                    shared.metrics.dispatch_errors.inc();
                    event!(
                        Level::WARN,
                        worker = %worker_id,
                        ?err,
                        "Failed to dispatch acquire-replicas",
                    );
                }
            });
        }
        for (worker_id, mut keys) in drop_by_worker {
            keys.sort();
            let shared = shared.clone();
            background_spawn!("amm_remove_replicas", async move {
                if let Err(err) = shared.worker_api.remove_replicas(&worker_id, keys).await {
                    shared.metrics.dispatch_errors.inc();
                    event!(
                        Level::WARN,
                        worker = %worker_id,
                        ?err,
                        "Failed to dispatch remove-replicas",
                    );
                }
            });
        }
        timer.measure();
        event!(Level::DEBUG, "Active memory manager run complete");
    }
}

/// Counters published by the manager.
#[derive(Default)]
pub struct AmmMetrics {
    /// Tick count and cumulative tick duration.
    pub run_once: AsyncCounterWrapper,
    pub suggestions_accepted: CounterWithTime,
    pub suggestions_rejected: CounterWithTime,
    pub policy_errors: CounterWithTime,
    pub dispatch_errors: CounterWithTime,
    pub workers_retired: CounterWithTime,
    pub retire_give_ups: CounterWithTime,
}
