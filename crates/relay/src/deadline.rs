// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Execution-budget governor.
//!
//! An invocation owns one [`ExecutionWindow`]. The window is consulted
//! before each batch of parts is started; work already in flight is never
//! interrupted, so the configured margins must cover draining a batch and
//! dispatching the continuation.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use jiff::{SignedDuration, Timestamp};

use crate::config::RelayConfig;

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp { Timestamp::now() }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: AtomicI64::new(start.as_microsecond()),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: SignedDuration) {
        let micros = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self { Self::new(Timestamp::now()) }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_microsecond(self.micros.load(Ordering::SeqCst)).unwrap_or(Timestamp::MAX)
    }
}

/// Per-invocation clock bounded by the execution budget.
#[derive(Debug, Clone)]
pub struct ExecutionWindow {
    clock:   Arc<dyn Clock>,
    started: Timestamp,
    /// Budget minus the dispatch and drain margins
    working: SignedDuration,
}

impl ExecutionWindow {
    /// Start the window now.
    #[must_use]
    pub fn start(clock: Arc<dyn Clock>, config: &RelayConfig) -> Self {
        let started = clock.now();
        Self {
            clock,
            started,
            working: config.working_budget(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> SignedDuration { self.clock.now().duration_since(self.started) }

    /// Time left for starting new work; negative once exhausted.
    #[must_use]
    pub fn remaining(&self) -> SignedDuration { self.working - self.elapsed() }

    /// Whether a new batch may be started.
    #[must_use]
    pub fn may_start_batch(&self) -> bool { self.remaining() > SignedDuration::ZERO }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(budget_secs: i64) -> RelayConfig {
        RelayConfig {
            execution_budget: SignedDuration::from_secs(budget_secs),
            dispatch_margin: SignedDuration::from_secs(1),
            drain_margin: SignedDuration::from_secs(1),
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_window_gates_on_working_budget() {
        let clock = Arc::new(ManualClock::default());
        let window = ExecutionWindow::start(clock.clone(), &config(10));

        assert!(window.may_start_batch());
        assert_eq!(window.remaining(), SignedDuration::from_secs(8));

        clock.advance(SignedDuration::from_millis(7_999));
        assert!(window.may_start_batch());

        clock.advance(SignedDuration::from_millis(1));
        assert!(!window.may_start_batch());
        assert_eq!(window.elapsed(), SignedDuration::from_secs(8));
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let window = ExecutionWindow::start(Arc::new(SystemClock), &config(10));
        assert!(window.elapsed() >= SignedDuration::ZERO);
        assert!(window.may_start_batch());
    }
}
