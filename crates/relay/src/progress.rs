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

use std::sync::Arc;

use jiff::{SignedDuration, Timestamp};
use relayer_base::readable_size::ReadableSize;
use tracing::{debug, warn};

use crate::{deadline::Clock, notify::Notifier};

/// Rate-limited, best-effort status updates.
///
/// Failures are logged and swallowed: progress reporting never affects the
/// transfer.
pub struct ProgressReporter {
    notifier:   Arc<dyn Notifier>,
    clock:      Arc<dyn Clock>,
    target:     String,
    handle:     Option<String>,
    interval:   SignedDuration,
    part_step:  u64,
    last_at:    Timestamp,
    last_parts: u64,
}

impl ProgressReporter {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        target: impl Into<String>,
        handle: Option<String>,
        interval: SignedDuration,
        part_step: u64,
        parts_done: u64,
    ) -> Self {
        let last_at = clock.now();
        Self {
            notifier,
            clock,
            target: target.into(),
            handle,
            interval,
            part_step,
            last_at,
            last_parts: parts_done,
        }
    }

    /// Whether a report for `parts_done` is due now.
    #[must_use]
    pub fn is_due(&self, parts_done: u64) -> bool {
        let stepped = self.part_step > 0 && parts_done.saturating_sub(self.last_parts) >= self.part_step;
        stepped || self.clock.now().duration_since(self.last_at) >= self.interval
    }

    /// Report progress if the rate limit allows it.
    pub async fn report(&mut self, filename: &str, parts_done: u64, total_parts: u64, part_size: u64) {
        if parts_done <= self.last_parts || !self.is_due(parts_done) {
            return;
        }
        self.last_at = self.clock.now();
        self.last_parts = parts_done;

        let percent = if total_parts == 0 { 100 } else { parts_done * 100 / total_parts };
        let text = format!(
            "Relaying {filename}: {parts_done}/{total_parts} parts, ~{} ({percent}%)",
            ReadableSize(parts_done.saturating_mul(part_size))
        );
        self.publish(&text).await;
    }

    /// Post `text` unconditionally, editing the status message when there is
    /// one.
    pub async fn publish(&mut self, text: &str) {
        if let Some(handle) = self.handle.clone() {
            if let Err(err) = self.notifier.edit(&self.target, &handle, text).await {
                warn!(target_id = %self.target, error = %err, "progress edit failed");
            }
        } else {
            match self.notifier.send(&self.target, text).await {
                Ok(handle) => self.handle = Some(handle),
                Err(err) => warn!(target_id = %self.target, error = %err, "progress send failed"),
            }
        }
        debug!(target_id = %self.target, text, "progress published");
    }

    #[must_use]
    pub fn handle(&self) -> Option<&str> { self.handle.as_deref() }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{deadline::ManualClock, error::RelayError};

    #[derive(Default)]
    struct Recorder {
        fail:     bool,
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, _target: &str, text: &str) -> Result<String, RelayError> {
            self.messages.lock().await.push(text.to_string());
            if self.fail {
                return Err(RelayError::Notify {
                    message: "down".to_string(),
                });
            }
            Ok("h1".to_string())
        }

        async fn edit(&self, _target: &str, _handle: &str, text: &str) -> Result<(), RelayError> {
            self.messages.lock().await.push(text.to_string());
            if self.fail {
                return Err(RelayError::Notify {
                    message: "down".to_string(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reports_are_rate_limited() {
        let notifier = Arc::new(Recorder::default());
        let clock = Arc::new(ManualClock::default());
        let mut reporter = ProgressReporter::new(
            notifier.clone(),
            clock.clone(),
            "chat",
            Some("h0".to_string()),
            SignedDuration::from_secs(3),
            4,
            0,
        );

        reporter.report("a.bin", 1, 10, 1024).await;
        reporter.report("a.bin", 2, 10, 1024).await;
        assert!(notifier.messages.lock().await.is_empty());

        reporter.report("a.bin", 4, 10, 1024).await;
        assert_eq!(notifier.messages.lock().await.len(), 1);

        clock.advance(SignedDuration::from_secs(3));
        reporter.report("a.bin", 5, 10, 1024).await;
        let messages = notifier.messages.lock().await;
        assert_eq!(messages.len(), 2);
        assert!(messages[1].contains("5/10 parts"), "{}", messages[1]);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let notifier = Arc::new(Recorder {
            fail:     true,
            messages: Mutex::default(),
        });
        let mut reporter = ProgressReporter::new(
            notifier.clone(),
            Arc::new(ManualClock::default()),
            "chat",
            None,
            SignedDuration::ZERO,
            1,
            0,
        );
        reporter.report("a.bin", 1, 2, 10).await;
        reporter.publish("done").await;
        assert_eq!(notifier.messages.lock().await.len(), 2);
        assert!(reporter.handle().is_none());
    }
}
