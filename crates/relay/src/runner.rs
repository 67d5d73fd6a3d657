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

use async_trait::async_trait;
use relayer_base::readable_size::ReadableSize;
use snafu::{OptionExt, ensure};
use tracing::{Span, error, field, info, instrument, warn};

use crate::{
    assembler::PartStream,
    checkpoint::CheckpointStore,
    config::RelayConfig,
    continuation::{ContinuationDispatcher, ContinuationTrigger},
    deadline::{Clock, ExecutionWindow, SystemClock},
    destination::BigObjectClient,
    error::{
        CheckpointCorruptedSnafu, EmptySourceSnafu, InvalidRequestSnafu, RelayError,
        SessionFailedSnafu, SessionMismatchSnafu, SessionNotFoundSnafu, SourceSizeMismatchSnafu,
    },
    finalizer::{FinalizeOutcome, Finalizer},
    metrics::{INVOCATION_DURATION_SECONDS, SESSIONS},
    notify::{LogNotifier, Notifier},
    progress::ProgressReporter,
    queue::InvocationHandler,
    source::SourceReader,
    types::{ContinuationRequest, RunOutcome, SessionStatus, TransferSession, total_parts},
    uploader::PartUploader,
};

/// A session ready to stream. `parts` is `None` when every part is already
/// uploaded and only finalization is left.
struct Prepared {
    session: TransferSession,
    parts:   Option<PartStream>,
}

enum Resumed {
    Ready(Prepared),
    Finalizing(String),
}

/// Runs one invocation of a relay session.
///
/// Each call to [`SessionRunner::run`] streams parts until the object is
/// complete or the execution window closes, in which case it checkpoints
/// the cursor and hands off to a continuation. Invocations share nothing
/// but the checkpoint store.
pub struct SessionRunner {
    config:    RelayConfig,
    store:     Arc<dyn CheckpointStore>,
    notifier:  Arc<dyn Notifier>,
    clock:     Arc<dyn Clock>,
    source:    SourceReader,
    uploader:  PartUploader,
    finalizer: Finalizer,
    trigger:   ContinuationTrigger,
}

#[bon::bon]
impl SessionRunner {
    /// Build a runner. The configuration is validated here.
    #[builder]
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn CheckpointStore>,
        destination: Arc<dyn BigObjectClient>,
        dispatcher: Arc<dyn ContinuationDispatcher>,
        notifier: Option<Arc<dyn Notifier>>,
        clock: Option<Arc<dyn Clock>>,
        client: Option<reqwest::Client>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let client = match client {
            Some(client) => client,
            None => config.http_client()?,
        };

        Ok(Self {
            source: SourceReader::new(client, &config),
            uploader: PartUploader::new(destination.clone()),
            finalizer: Finalizer::new(store.clone(), destination),
            trigger: ContinuationTrigger::new(dispatcher, &config),
            notifier: notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
            store,
            config,
        })
    }
}

impl SessionRunner {
    #[must_use]
    pub const fn config(&self) -> &RelayConfig { &self.config }

    /// Run one invocation.
    ///
    /// Rejected requests (stale, replaced or malformed) return their error
    /// without touching any session. Every other error is terminal for the
    /// session: its checkpoint is marked `Failed` and the cause is reported
    /// to the notify target.
    #[instrument(
        name = "relay",
        skip_all,
        fields(
            source_key = %request.source_key,
            next_part_index = request.next_part_index,
            session_id = field::Empty,
        )
    )]
    pub async fn run(&self, request: ContinuationRequest) -> Result<RunOutcome, RelayError> {
        let window = ExecutionWindow::start(self.clock.clone(), &self.config);
        let mut current = None;

        let result = self.drive(&request, &window, &mut current).await;

        if let Err(err) = &result
            && !err.is_rejection()
        {
            self.abort(&request, current.as_ref(), err).await;
        }

        let outcome = match &result {
            Ok(RunOutcome::Completed { .. }) => "completed",
            Ok(RunOutcome::Suspended {
                dispatched: true, ..
            }) => "suspended",
            Ok(RunOutcome::Suspended { .. }) => "stalled",
            Ok(RunOutcome::AlreadyFinalizing { .. }) => "already_finalizing",
            Err(err) if err.is_rejection() => "rejected",
            Err(_) => "failed",
        };
        SESSIONS.with_label_values(&[outcome]).inc();
        INVOCATION_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(window.elapsed().as_secs_f64());

        result
    }

    async fn drive(
        &self,
        request: &ContinuationRequest,
        window: &ExecutionWindow,
        current: &mut Option<TransferSession>,
    ) -> Result<RunOutcome, RelayError> {
        validate_request(request)?;

        let Prepared { session, parts } = if request.is_fresh_start() {
            self.start_fresh(request, current).await?
        } else {
            match self.resume(request, current).await? {
                Resumed::Ready(prepared) => prepared,
                Resumed::Finalizing(session_id) => {
                    info!(session_id, "session is already finalizing");
                    return Ok(RunOutcome::AlreadyFinalizing { session_id });
                }
            }
        };
        Span::current().record("session_id", session.session_id.as_str());

        let mut reporter = ProgressReporter::new(
            self.notifier.clone(),
            self.clock.clone(),
            session.notify_target.clone(),
            session.status_handle.clone(),
            self.config.progress_interval,
            self.config.progress_part_step,
            request.next_part_index,
        );

        let mut next = request.next_part_index;
        if let Some(mut parts) = parts {
            // A source that ignores `Range` cannot be reopened mid-object, so
            // its session keeps going past the window instead of suspending.
            while next < session.total_parts {
                if session.supports_range && !window.may_start_batch() {
                    return self.suspend(&session, next).await;
                }

                let remaining = session.total_parts - next;
                let want = usize::try_from(remaining)
                    .unwrap_or(usize::MAX)
                    .min(self.config.parallel_uploads);
                let batch = parts.next_batch(want).await?;

                let received: u64 = batch.iter().map(|part| part.len()).sum();
                let short = batch.len() < want
                    || batch
                        .iter()
                        .any(|part| part.len() != session.part_len(part.index));
                ensure!(
                    !short,
                    SourceSizeMismatchSnafu {
                        url:      &session.source_key,
                        expected: session.total_size,
                        actual:   session.start_byte(next) + received,
                    }
                );

                self.uploader
                    .upload_batch(&session.session_id, session.total_parts, &batch)
                    .await?;
                next += batch.len() as u64;
                reporter
                    .report(&session.filename, next, session.total_parts, session.part_size)
                    .await;
            }

            ensure!(
                parts.is_drained().await?,
                SourceSizeMismatchSnafu {
                    url:      &session.source_key,
                    expected: session.total_size,
                    actual:   session.total_size + parts.buffered() as u64,
                }
            );
        }

        match self.finalizer.finalize(&session).await? {
            FinalizeOutcome::Composed => {
                reporter
                    .publish(&format!(
                        "Relayed {} ({}) in {} parts",
                        session.filename,
                        ReadableSize(session.total_size),
                        session.total_parts
                    ))
                    .await;
                Ok(RunOutcome::Completed {
                    session_id:  session.session_id,
                    total_parts: session.total_parts,
                    total_size:  session.total_size,
                })
            }
            FinalizeOutcome::AlreadyClaimed => Ok(RunOutcome::AlreadyFinalizing {
                session_id: session.session_id,
            }),
        }
    }

    /// Open the source at byte 0 and replace any checkpoint for the key with
    /// a new session.
    async fn start_fresh(
        &self,
        request: &ContinuationRequest,
        current: &mut Option<TransferSession>,
    ) -> Result<Prepared, RelayError> {
        let key = request.source_key.as_str();
        let (metadata, stream) = self.source.open(key, 0).await?;
        ensure!(metadata.total_size > 0, EmptySourceSnafu { url: key });

        let part_size = self.config.part_size.as_bytes();
        let now = self.clock.now().as_second();
        let mut session = TransferSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            source_key: key.to_string(),
            total_size: metadata.total_size,
            part_size,
            total_parts: total_parts(metadata.total_size, part_size),
            filename: metadata.filename,
            content_type: metadata.content_type,
            supports_range: metadata.supports_range,
            status: SessionStatus::Streaming,
            notify_target: request.notify_target.clone(),
            status_handle: request.status_handle.clone(),
            resume_hint: 0,
            created_at: now,
            updated_at: now,
            expires_at: now.saturating_add(self.config.checkpoint_ttl.as_secs()),
        };

        if let Some(previous) = self.store.get(key).await? {
            info!(
                previous_session_id = %previous.session_id,
                status = %previous.status,
                "replacing existing checkpoint"
            );
        }

        let mut announcer = ProgressReporter::new(
            self.notifier.clone(),
            self.clock.clone(),
            session.notify_target.clone(),
            session.status_handle.clone(),
            self.config.progress_interval,
            self.config.progress_part_step,
            0,
        );
        announcer
            .publish(&format!(
                "Relaying {} ({}) in {} parts",
                session.filename,
                ReadableSize(session.total_size),
                session.total_parts
            ))
            .await;
        session.status_handle = announcer.handle().map(str::to_string);

        self.store
            .put(key, &session, self.config.checkpoint_ttl)
            .await?;
        *current = Some(session.clone());
        info!(
            session_id = %session.session_id,
            total_size = session.total_size,
            total_parts = session.total_parts,
            supports_range = session.supports_range,
            "session started"
        );

        Ok(Prepared {
            parts: Some(PartStream::new(stream, self.config.part_size_bytes(), 0)),
            session,
        })
    }

    /// Load the checkpoint named by a continuation and reopen the source at
    /// its cursor.
    async fn resume(
        &self,
        request: &ContinuationRequest,
        current: &mut Option<TransferSession>,
    ) -> Result<Resumed, RelayError> {
        let key = request.source_key.as_str();
        let session = self
            .store
            .get(key)
            .await?
            .context(SessionNotFoundSnafu { source_key: key })?;

        let expected = request.session_id.as_deref().unwrap_or_default();
        ensure!(
            session.session_id == expected,
            SessionMismatchSnafu {
                source_key: key,
                expected,
                actual: &session.session_id,
            }
        );
        match session.status {
            SessionStatus::Failed => {
                return SessionFailedSnafu {
                    source_key: key,
                    session_id: &session.session_id,
                }
                .fail();
            }
            SessionStatus::Finalizing => return Ok(Resumed::Finalizing(session.session_id)),
            SessionStatus::Streaming => {}
        }

        let next = request.next_part_index;
        ensure!(
            next <= session.total_parts,
            InvalidRequestSnafu {
                message: format!(
                    "next_part_index {next} is past the last part ({})",
                    session.total_parts
                ),
            }
        );
        *current = Some(session.clone());

        if next == session.total_parts {
            return Ok(Resumed::Ready(Prepared {
                session,
                parts: None,
            }));
        }

        let part_size = usize::try_from(session.part_size)
            .ok()
            .filter(|size| *size > 0)
            .context(CheckpointCorruptedSnafu { key })?;
        let (metadata, stream) = self.source.open(key, session.start_byte(next)).await?;
        ensure!(
            metadata.total_size == 0 || metadata.total_size == session.total_size,
            SourceSizeMismatchSnafu {
                url:      key,
                expected: session.total_size,
                actual:   metadata.total_size,
            }
        );
        info!(session_id = %session.session_id, next_part_index = next, "session resumed");

        Ok(Resumed::Ready(Prepared {
            parts: Some(PartStream::new(stream, part_size, next)),
            session,
        }))
    }

    /// Record the cursor and hand off to the next invocation.
    async fn suspend(
        &self,
        session: &TransferSession,
        next_part_index: u64,
    ) -> Result<RunOutcome, RelayError> {
        let recorded = self
            .store
            .record_progress(&session.source_key, &session.session_id, next_part_index)
            .await?;
        let dispatched = if recorded {
            self.trigger
                .fire(&session.continuation(next_part_index))
                .await
        } else {
            warn!(
                session_id = %session.session_id,
                "checkpoint changed underneath the session, not dispatching"
            );
            false
        };

        info!(
            session_id = %session.session_id,
            next_part_index,
            dispatched,
            "execution window closed"
        );
        Ok(RunOutcome::Suspended {
            session_id: session.session_id.clone(),
            next_part_index,
            dispatched,
        })
    }

    /// Mark the session failed and tell the requester why.
    async fn abort(
        &self,
        request: &ContinuationRequest,
        session: Option<&TransferSession>,
        err: &RelayError,
    ) {
        error!(error = %err, "relay failed");

        if let Some(session) = session {
            // Already `Failed` after a compose failure; the swap is then a no-op.
            if let Err(store_err) = self
                .store
                .compare_and_swap_status(
                    &session.source_key,
                    &session.session_id,
                    SessionStatus::Streaming,
                    SessionStatus::Failed,
                )
                .await
            {
                warn!(error = %store_err, "failed to mark session failed");
            }
        }

        let name = session.map_or(request.source_key.as_str(), |s| s.filename.as_str());
        let handle = session
            .and_then(|s| s.status_handle.clone())
            .or_else(|| request.status_handle.clone());
        let mut reporter = ProgressReporter::new(
            self.notifier.clone(),
            self.clock.clone(),
            request.notify_target.clone(),
            handle,
            self.config.progress_interval,
            self.config.progress_part_step,
            0,
        );
        reporter
            .publish(&format!("Relay of {name} failed: {err}"))
            .await;
    }
}

#[async_trait]
impl InvocationHandler for SessionRunner {
    async fn handle(&self, request: ContinuationRequest) {
        match self.run(request).await {
            Ok(outcome) => info!(?outcome, "invocation finished"),
            Err(err) if err.is_rejection() => warn!(error = %err, "invocation rejected"),
            Err(err) => error!(error = %err, "invocation failed"),
        }
    }
}

fn validate_request(request: &ContinuationRequest) -> Result<(), RelayError> {
    ensure!(
        !request.source_key.trim().is_empty(),
        InvalidRequestSnafu {
            message: "source_key is required",
        }
    );
    ensure!(
        !request.notify_target.trim().is_empty(),
        InvalidRequestSnafu {
            message: "notify_target is required",
        }
    );
    ensure!(
        !request.is_fresh_start() || request.next_part_index == 0,
        InvalidRequestSnafu {
            message: "a request without session_id must start at part 0",
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request() {
        let fresh = ContinuationRequest::builder()
            .source_key("https://example.com/a.bin")
            .notify_target("chat")
            .build();
        validate_request(&fresh).unwrap();

        let misplaced = ContinuationRequest {
            next_part_index: 3,
            ..fresh.clone()
        };
        assert!(matches!(
            validate_request(&misplaced),
            Err(RelayError::InvalidRequest { .. })
        ));

        let anonymous = ContinuationRequest {
            notify_target: " ".to_string(),
            ..fresh
        };
        assert!(validate_request(&anonymous).unwrap_err().is_rejection());
    }
}
