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

use async_trait::async_trait;
use hashbrown::HashMap;
use memshed_error::Error;

use crate::cluster_state::{TaskKey, WorkerId};

/// The RPC surface the memory manager needs from workers. Enacted
/// suggestions become one call per recipient or source worker; the manager
/// never waits on the outcome and never retries, the next tick re-derives
/// whatever is still warranted from fresh cluster state.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Asks `worker` to fetch a replica of each key from any of the listed
    /// source workers.
    async fn acquire_replicas(
        &self,
        worker: &WorkerId,
        keys_with_sources: HashMap<TaskKey, Vec<WorkerId>>,
    ) -> Result<(), Error>;

    /// Asks `worker` to drop its replicas of `keys`. Best effort: the worker
    /// refuses keys that executing tasks are currently consuming.
    async fn remove_replicas(&self, worker: &WorkerId, keys: Vec<TaskKey>) -> Result<(), Error>;

    /// Asks `worker` to shut down. Issued by the retirement workflow once
    /// the worker holds no data.
    async fn close_worker(&self, worker: &WorkerId) -> Result<(), Error>;
}
