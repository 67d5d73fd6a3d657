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

//! Safety net for sessions whose continuation was lost.
//!
//! A streaming checkpoint that has not been touched for longer than the
//! stale threshold is either re-dispatched from its last hand-off point or
//! surfaced to its requester.

use std::sync::Arc;

use jiff::SignedDuration;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    checkpoint::CheckpointStore,
    config::{RelayConfig, to_std},
    continuation::{ContinuationDispatcher, ContinuationTrigger},
    deadline::{Clock, SystemClock},
    error::RelayError,
    metrics::REAPED_SESSIONS,
    notify::Notifier,
    progress::ProgressReporter,
    types::{SessionStatus, TransferSession},
};

/// What to do with a stalled session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReaperPolicy {
    /// Dispatch a continuation from the session's `resume_hint`
    #[default]
    Redispatch,
    /// Tell the requester the relay stalled
    Alert,
}

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned:      usize,
    pub redispatched: usize,
    pub alerted:      usize,
}

pub struct Reaper {
    store:           Arc<dyn CheckpointStore>,
    notifier:        Arc<dyn Notifier>,
    trigger:         ContinuationTrigger,
    clock:           Arc<dyn Clock>,
    policy:          ReaperPolicy,
    stale_threshold: SignedDuration,
    interval:        SignedDuration,
}

impl Reaper {
    pub fn new(
        config: &RelayConfig,
        policy: ReaperPolicy,
        store: Arc<dyn CheckpointStore>,
        dispatcher: Arc<dyn ContinuationDispatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            notifier,
            trigger: ContinuationTrigger::new(dispatcher, config),
            clock: Arc::new(SystemClock),
            policy,
            stale_threshold: config.stale_threshold,
            interval: config.reaper_interval,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Scan the store once.
    pub async fn sweep(&self) -> Result<SweepReport, RelayError> {
        let now = self.clock.now().as_second();
        let threshold = self.stale_threshold.as_secs();
        let mut report = SweepReport::default();

        for session in self.store.list().await? {
            report.scanned += 1;
            if session.status != SessionStatus::Streaming
                || now.saturating_sub(session.updated_at) <= threshold
            {
                continue;
            }

            warn!(
                session_id = %session.session_id,
                source_key = %session.source_key,
                resume_hint = session.resume_hint,
                idle_secs = now.saturating_sub(session.updated_at),
                "stalled session"
            );
            match self.policy {
                ReaperPolicy::Redispatch => {
                    if self.redispatch(&session).await {
                        report.redispatched += 1;
                    }
                }
                ReaperPolicy::Alert => {
                    self.alert(&session).await;
                    report.alerted += 1;
                }
            }

            // Touch the checkpoint so the next sweep does not pick it up again
            // before the new invocation had a chance to run.
            self.store
                .record_progress(&session.source_key, &session.session_id, session.resume_hint)
                .await?;
        }

        Ok(report)
    }

    /// Sweep every `reaper_interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(to_std(self.interval));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(policy = %self.policy, "Reaper started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.redispatched + report.alerted > 0 => {
                            info!(?report, "reaper sweep");
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "reaper sweep failed"),
                    }
                }
            }
        }
        info!("Reaper stopped");
    }

    async fn redispatch(&self, session: &TransferSession) -> bool {
        let accepted = self
            .trigger
            .fire(&session.continuation(session.resume_hint))
            .await;
        REAPED_SESSIONS
            .with_label_values(&[if accepted { "redispatched" } else { "redispatch_failed" }])
            .inc();
        accepted
    }

    async fn alert(&self, session: &TransferSession) {
        let mut reporter = ProgressReporter::new(
            self.notifier.clone(),
            self.clock.clone(),
            session.notify_target.clone(),
            session.status_handle.clone(),
            SignedDuration::ZERO,
            0,
            0,
        );
        reporter
            .publish(&format!(
                "Relay of {} stalled at part {}/{}",
                session.filename, session.resume_hint, session.total_parts
            ))
            .await;
        REAPED_SESSIONS.with_label_values(&["alerted"]).inc();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use jiff::Timestamp;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        checkpoint::{MemoryCheckpointStore, tests::session},
        deadline::ManualClock,
        notify::LogNotifier,
        types::ContinuationRequest,
    };

    #[derive(Default)]
    struct Recording {
        requests: Mutex<Vec<ContinuationRequest>>,
    }

    #[async_trait]
    impl ContinuationDispatcher for Recording {
        async fn dispatch(&self, request: &ContinuationRequest) -> Result<(), RelayError> {
            self.requests.lock().await.push(request.clone());
            Ok(())
        }
    }

    async fn seeded_store() -> Arc<MemoryCheckpointStore> {
        let store = Arc::new(MemoryCheckpointStore::new());
        let ttl = SignedDuration::from_hours(1);
        let mut streaming = session("https://example.com/a.bin", "s1");
        streaming.resume_hint = 2;
        store.put(&streaming.source_key, &streaming, ttl).await.unwrap();

        let mut finalizing = session("https://example.com/b.bin", "s2");
        finalizing.status = SessionStatus::Finalizing;
        store.put(&finalizing.source_key, &finalizing, ttl).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_sweep_redispatches_stale_streaming_sessions() {
        let store = seeded_store().await;
        let dispatcher = Arc::new(Recording::default());
        let clock = Arc::new(ManualClock::new(Timestamp::now()));
        let reaper = Reaper::new(
            &RelayConfig::default(),
            ReaperPolicy::Redispatch,
            store.clone(),
            dispatcher.clone(),
            Arc::new(LogNotifier),
        )
        .with_clock(clock.clone());

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.redispatched, 0);

        clock.advance(SignedDuration::from_mins(11));
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.redispatched, 1);

        let requests = dispatcher.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].source_key, "https://example.com/a.bin");
        assert_eq!(requests[0].next_part_index, 2);
        assert_eq!(requests[0].session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_alert_policy_does_not_dispatch() {
        let store = seeded_store().await;
        let dispatcher = Arc::new(Recording::default());
        let clock = Arc::new(ManualClock::new(Timestamp::now()));
        clock.advance(SignedDuration::from_mins(30));
        let reaper = Reaper::new(
            &RelayConfig::default(),
            ReaperPolicy::Alert,
            store,
            dispatcher.clone(),
            Arc::new(LogNotifier),
        )
        .with_clock(clock);

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.alerted, 1);
        assert!(dispatcher.requests.lock().await.is_empty());
    }
}
