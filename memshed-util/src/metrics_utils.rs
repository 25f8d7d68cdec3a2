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

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A counter that also remembers the unix time of the last increment.
#[derive(Debug, Default)]
pub struct CounterWithTime {
    counter: AtomicU64,
    last_time: AtomicU64,
}

impl CounterWithTime {
    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.counter.fetch_add(n, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        self.last_time.store(now, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn last_time_secs(&self) -> u64 {
        self.last_time.load(Ordering::Relaxed)
    }
}

/// Counts successes and failures of a synchronous fallible function.
#[derive(Debug, Default)]
pub struct FuncCounterWrapper {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
}

impl FuncCounterWrapper {
    pub fn wrap<T, E>(&self, func: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let result = (func)();
        if result.is_ok() {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Tracks call counts and cumulative wall time of an async code path.
#[derive(Debug, Default)]
pub struct AsyncCounterWrapper {
    pub calls: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub total_nanos: AtomicU64,
}

impl AsyncCounterWrapper {
    pub async fn wrap<T, E, F: std::future::Future<Output = Result<T, E>>>(
        &self,
        fut: F,
    ) -> Result<T, E> {
        let timer = self.begin_timer();
        let result = fut.await;
        if result.is_ok() {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        timer.measure();
        result
    }

    pub fn begin_timer(&self) -> Timer<'_> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Timer {
            start: Instant::now(),
            total_nanos: &self.total_nanos,
        }
    }
}

pub struct Timer<'a> {
    start: Instant,
    total_nanos: &'a AtomicU64,
}

impl Timer<'_> {
    pub fn measure(self) {
        self.total_nanos
            .fetch_add(self.start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}
