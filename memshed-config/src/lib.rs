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

pub mod serde_utils;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_utils::{deserialize_duration, serialize_duration};

/// Configuration of the active memory manager scheduler extension.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActiveMemoryManagerConfig {
    /// Whether to start the periodic control loop when the scheduler boots.
    /// When false the manager only runs when triggered manually.
    #[serde(default)]
    pub start: bool,

    /// Period between control loop iterations, as a humantime string
    /// (eg: "2s", "100ms"). Each iteration consumes every policy once and
    /// dispatches the resulting replica changes to workers.
    #[serde(
        default = "default_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,

    /// Policies installed at boot, run in the order listed here. Policies
    /// may also be added and removed at runtime.
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl Default for ActiveMemoryManagerConfig {
    fn default() -> Self {
        Self {
            start: false,
            interval: default_interval(),
            policies: vec![],
        }
    }
}

impl ActiveMemoryManagerConfig {
    /// Parses a JSON5 configuration document.
    pub fn from_json5(text: &str) -> Result<Self, serde_json5::Error> {
        serde_json5::from_str(text)
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(2)
}

#[allow(non_camel_case_types)]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum PolicyConfig {
    /// For every task with more than one in-memory replica, drop all but one
    /// copy. The arbiter still protects replicas that executing dependents
    /// are using.
    reduce_replicas(ReduceReplicasConfig),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReduceReplicasConfig {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_stopped_with_two_second_interval() {
        let config = ActiveMemoryManagerConfig::from_json5("{}").unwrap();
        assert_eq!(config.start, false);
        assert_eq!(config.interval, Duration::from_secs(2));
        assert_eq!(config.policies.len(), 0);
    }

    #[test]
    fn parses_interval_and_policies() {
        let config = ActiveMemoryManagerConfig::from_json5(
            r#"{
                start: true,
                interval: "100ms",
                policies: [
                    { reduce_replicas: {} },
                ],
            }"#,
        )
        .unwrap();
        assert_eq!(config.start, true);
        assert_eq!(config.interval, Duration::from_millis(100));
        assert!(matches!(config.policies[0], PolicyConfig::reduce_replicas(_)));
    }

    #[test]
    fn rejects_malformed_interval() {
        assert!(ActiveMemoryManagerConfig::from_json5(r#"{ interval: "nonsense" }"#).is_err());
    }
}
