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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};

/// Spawns a named, tracing-instrumented task and returns a guard that aborts
/// the task when dropped. Use for tasks whose lifetime is tied to an owner.
#[macro_export]
macro_rules! spawn {
    ($name:expr, $fut:expr) => {{
        $crate::task::JoinHandleDropGuard::new(tokio::spawn(tracing::Instrument::instrument(
            $fut,
            tracing::info_span!($name),
        )))
    }};
}

/// Spawns a named, tracing-instrumented task that is detached from the
/// caller. Use for fire-and-forget work such as outbound RPC dispatch.
#[macro_export]
macro_rules! background_spawn {
    ($name:expr, $fut:expr) => {{
        let _ = tokio::spawn(tracing::Instrument::instrument(
            $fut,
            tracing::info_span!($name),
        ));
    }};
}

/// Simple wrapper that will abort a future that is running in another spawn
/// in the event that this handle gets dropped.
#[derive(Debug)]
#[must_use]
pub struct JoinHandleDropGuard<T = ()> {
    inner: JoinHandle<T>,
}

impl<T> JoinHandleDropGuard<T> {
    pub fn new(inner: JoinHandle<T>) -> Self {
        Self { inner }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for JoinHandleDropGuard<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T> Drop for JoinHandleDropGuard<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}
