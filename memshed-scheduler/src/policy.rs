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

use hashbrown::HashSet;
use memshed_error::Error;

use crate::cluster_state::{TaskKey, WorkerId};
use crate::suggestion_arbiter::SuggestionArbiter;

/// A producer of drop/replicate suggestions, consulted once per manager
/// tick. Policies may keep mutable state across ticks.
///
/// `run` feeds suggestions to the arbiter one at a time through
/// [`SuggestionArbiter::suggest`] and immediately observes each decision,
/// so a later suggestion always sees the effects of every earlier accepted
/// one within the same tick. Policies must not block or await in `run`; the
/// whole tick executes synchronously against one consistent view of the
/// cluster.
pub trait MemoryPolicy: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// One pass of the policy. Returning an error skips the policy for the
    /// remainder of the tick but keeps it installed; returning
    /// [`PolicyOutcome::Remove`] uninstalls it.
    fn run(&mut self, amm: &mut SuggestionArbiter<'_>) -> Result<PolicyOutcome, Error>;
}

/// What the manager should do with a policy after a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyOutcome {
    Retain,
    Remove,
}

/// Handle to an installed policy, returned by `add_policy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PolicyId(pub(crate) u64);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "policy-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuggestionOp {
    Drop,
    Replicate,
}

impl fmt::Display for SuggestionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuggestionOp::Drop => f.write_str("drop"),
            SuggestionOp::Replicate => f.write_str("replicate"),
        }
    }
}

/// A proposed replica change.
///
/// `candidates` is an option-of-set on purpose: `None` means "pick any
/// eligible worker" while `Some(empty)` is an explicit "do nothing" that the
/// arbiter drops without logging a rejection.
#[derive(Clone, Debug)]
pub struct Suggestion {
    pub op: SuggestionOp,
    pub key: TaskKey,
    pub candidates: Option<HashSet<WorkerId>>,
}

impl Suggestion {
    pub fn drop(key: impl Into<TaskKey>, candidates: Option<HashSet<WorkerId>>) -> Self {
        Self {
            op: SuggestionOp::Drop,
            key: key.into(),
            candidates,
        }
    }

    pub fn replicate(key: impl Into<TaskKey>, candidates: Option<HashSet<WorkerId>>) -> Self {
        Self {
            op: SuggestionOp::Replicate,
            key: key.into(),
            candidates,
        }
    }
}
