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

mod utils;

use std::sync::Arc;

use memshed_scheduler::cluster_state::{WorkerId, WorkerStatus};
use utils::*;

fn ids(addresses: &[&str]) -> Vec<WorkerId> {
    addresses.iter().map(|a| WorkerId::from(*a)).collect()
}

#[cfg(test)]
mod retire_worker_tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn retire_worker_with_unique_data_migrates_it() {
        init_tracing();
        let cluster = cluster_with_workers(&["tcp://a", "tcp://b"]);
        add_memory_task(&cluster, "x", 10, &["tcp://a"]);
        let api = MockWorkerApi::new(cluster.clone());
        let manager = test_manager(&cluster, &api, vec![]);

        let retired = manager
            .retire_workers(ids(&["tcp://a"]), false, true)
            .await
            .unwrap();

        assert_eq!(retired, worker_ids(&["tcp://a"]));
        assert!(!cluster.lock().workers.contains_key(&WorkerId::from("tcp://a")));
        assert_eq!(who_has(&cluster, "x"), worker_ids(&["tcp://b"]));
        assert_eq!(manager.policy_count().await, 0);
    }

    #[tokio::test]
    async fn retire_all_holders_at_once_keeps_one_replica_alive() {
        let cluster = cluster_with_workers(&["tcp://w1", "tcp://w2", "tcp://w3"]);
        add_memory_task(&cluster, "x", 10, &["tcp://w1", "tcp://w2"]);
        let api = MockWorkerApi::new(cluster.clone());
        let manager = test_manager(&cluster, &api, vec![]);

        let retired = manager
            .retire_workers(ids(&["tcp://w1", "tcp://w2"]), false, true)
            .await
            .unwrap();

        assert_eq!(retired, worker_ids(&["tcp://w1", "tcp://w2"]));
        assert_eq!(who_has(&cluster, "x"), worker_ids(&["tcp://w3"]));
        let state = cluster.lock();
        assert!(!state.workers.contains_key(&WorkerId::from("tcp://w1")));
        assert!(!state.workers.contains_key(&WorkerId::from("tcp://w2")));
    }

    #[tokio::test]
    async fn replicated_keys_are_dropped_not_copied() {
        let cluster = cluster_with_workers(&["tcp://a", "tcp://b"]);
        add_memory_task(&cluster, "x", 10, &["tcp://a", "tcp://b"]);
        add_memory_task(&cluster, "y", 10, &["tcp://a"]);
        let api = MockWorkerApi::new(cluster.clone());
        let manager = test_manager(&cluster, &api, vec![]);

        let retired = manager
            .retire_workers(ids(&["tcp://a"]), false, true)
            .await
            .unwrap();

        assert_eq!(retired, worker_ids(&["tcp://a"]));
        assert_eq!(who_has(&cluster, "x"), worker_ids(&["tcp://b"]));
        assert_eq!(who_has(&cluster, "y"), worker_ids(&["tcp://b"]));
        // x already had a copy on tcp://b; only y needed a transfer.
        let acquires = api
            .calls
            .lock()
            .iter()
            .filter(|call| matches!(call, RpcCall::Acquire { .. }))
            .count();
        assert_eq!(acquires, 1);
    }

    #[tokio::test]
    async fn retire_worker_without_data_is_immediate() {
        let cluster = cluster_with_workers(&["tcp://a", "tcp://b"]);
        let api = MockWorkerApi::new(cluster.clone());
        let manager = test_manager(&cluster, &api, vec![]);

        let retired = manager
            .retire_workers(ids(&["tcp://a"]), false, true)
            .await
            .unwrap();
        assert_eq!(retired, worker_ids(&["tcp://a"]));
    }

    #[tokio::test]
    async fn retire_unknown_worker_returns_empty_set() {
        let cluster = cluster_with_workers(&["tcp://a"]);
        let api = MockWorkerApi::new(cluster.clone());
        let manager = test_manager(&cluster, &api, vec![]);

        let retired = manager
            .retire_workers(ids(&["tcp://nope"]), false, true)
            .await
            .unwrap();
        assert!(retired.is_empty());
    }

    #[tokio::test]
    async fn gives_up_when_no_recipient_exists_and_restores_status() {
        let cluster = cluster_with_workers(&["tcp://a", "tcp://b", "tcp://c"]);
        set_status(&cluster, "tcp://c", WorkerStatus::Paused);
        add_memory_task(&cluster, "x", 10, &["tcp://b"]);
        let api = MockWorkerApi::new(cluster.clone());
        let manager = test_manager(&cluster, &api, vec![]);

        // tcp://a holds nothing and retires; tcp://b holds unique data with
        // only a paused worker left to receive it, so it cannot retire.
        let retired = manager
            .retire_workers(ids(&["tcp://a", "tcp://b"]), false, true)
            .await
            .unwrap();

        assert_eq!(retired, worker_ids(&["tcp://a"]));
        let state = cluster.lock();
        assert!(!state.workers.contains_key(&WorkerId::from("tcp://a")));
        assert_eq!(
            state.workers.get(&WorkerId::from("tcp://b")).unwrap().status,
            WorkerStatus::Running
        );
        drop(state);
        assert_eq!(who_has(&cluster, "x"), worker_ids(&["tcp://b"]));
        assert_eq!(manager.policy_count().await, 0);
        assert_eq!(manager.metrics().retire_give_ups.count(), 1);
    }

    #[tokio::test]
    async fn remove_false_keeps_the_drained_worker_registered() {
        let cluster = cluster_with_workers(&["tcp://a", "tcp://b"]);
        add_memory_task(&cluster, "x", 10, &["tcp://a"]);
        let api = MockWorkerApi::new(cluster.clone());
        let manager = test_manager(&cluster, &api, vec![]);

        let retired = manager
            .retire_workers(ids(&["tcp://a"]), false, false)
            .await
            .unwrap();

        assert_eq!(retired, worker_ids(&["tcp://a"]));
        let state = cluster.lock();
        let worker = state.workers.get(&WorkerId::from("tcp://a")).unwrap();
        assert!(worker.has_what.is_empty());
        drop(state);
        assert_eq!(who_has(&cluster, "x"), worker_ids(&["tcp://b"]));
        assert_eq!(manager.policy_count().await, 0);
    }

    #[tokio::test]
    async fn close_workers_sends_the_close_rpc() {
        let cluster = cluster_with_workers(&["tcp://a", "tcp://b"]);
        let api = MockWorkerApi::new(cluster.clone());
        let manager = test_manager(&cluster, &api, vec![]);

        let retired = manager
            .retire_workers(ids(&["tcp://a"]), true, true)
            .await
            .unwrap();
        assert_eq!(retired, worker_ids(&["tcp://a"]));
        assert!(api.calls.lock().contains(&RpcCall::Close {
            worker: WorkerId::from("tcp://a"),
        }));
    }

    #[tokio::test]
    async fn faulty_recipient_is_retried_until_eviction_frees_another() {
        init_tracing();
        let cluster = cluster_with_workers(&["tcp://a", "tcp://b", "tcp://c"]);
        add_memory_task(&cluster, "x", 10, &["tcp://a"]);
        // tcp://b looks most attractive but is unreachable.
        set_optimistic_memory(&cluster, "tcp://b", 0);
        set_optimistic_memory(&cluster, "tcp://c", 100 * 1024 * 1024);
        let api = MockWorkerApi::new(cluster.clone());
        api.set_offline("tcp://b");
        let manager = Arc::new(test_manager(&cluster, &api, vec![]));
        manager.start();

        let task_manager = manager.clone();
        let retire_task = tokio::spawn(async move {
            task_manager
                .retire_workers(ids(&["tcp://a"]), false, true)
                .await
        });

        // The replication RPC keeps failing against the dead recipient.
        wait_for(|| manager.metrics().dispatch_errors.count() >= 2).await;
        assert_eq!(who_has(&cluster, "x"), worker_ids(&["tcp://a"]));

        // The worker TTL mechanism eventually evicts the dead worker; the
        // next tick picks a live recipient and retirement completes.
        cluster.lock().remove_worker(&WorkerId::from("tcp://b"));
        let retired = retire_task.await.unwrap().unwrap();
        assert_eq!(retired, worker_ids(&["tcp://a"]));
        assert_eq!(who_has(&cluster, "x"), worker_ids(&["tcp://c"]));
    }
}
