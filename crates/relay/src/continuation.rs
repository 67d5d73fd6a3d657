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
use backon::{ExponentialBuilder, Retryable};
use snafu::{ResultExt, ensure};
use tracing::{error, info, warn};

use crate::{
    config::{RelayConfig, to_std},
    error::{ConfigSnafu, DestinationSnafu, NetworkSnafu, RelayError},
    metrics::CONTINUATIONS,
    types::ContinuationRequest,
};

/// Schedules a fresh invocation of the engine.
#[async_trait]
pub trait ContinuationDispatcher: Send + Sync {
    /// `Ok` means the request was accepted for execution.
    async fn dispatch(&self, request: &ContinuationRequest) -> Result<(), RelayError>;
}

/// Posts the continuation to the invocation endpoint of a relay service.
pub struct HttpContinuationDispatcher {
    client:   reqwest::Client,
    endpoint: String,
    token:    Option<String>,
}

impl HttpContinuationDispatcher {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Result<Self, RelayError> {
        let endpoint = endpoint.into();
        ensure!(
            !endpoint.is_empty(),
            ConfigSnafu {
                message: "continuation endpoint is required",
            }
        );
        Ok(Self {
            client,
            endpoint,
            token: None,
        })
    }

    /// Authenticate continuations with a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl ContinuationDispatcher for HttpContinuationDispatcher {
    async fn dispatch(&self, request: &ContinuationRequest) -> Result<(), RelayError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.context(NetworkSnafu)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        DestinationSnafu {
            status: status.as_u16(),
            body,
        }
        .fail()
    }
}

/// Hands a suspended session to the next invocation.
///
/// Dispatch is retried with a short exponential backoff. When every attempt
/// fails the session stalls silently: the error is logged and counted, the
/// requester is not told, and the reaper is left to pick it up.
pub struct ContinuationTrigger {
    dispatcher: Arc<dyn ContinuationDispatcher>,
    backoff:    ExponentialBuilder,
}

impl ContinuationTrigger {
    pub fn new(dispatcher: Arc<dyn ContinuationDispatcher>, config: &RelayConfig) -> Self {
        let min_delay = to_std(config.continuation_backoff);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_delay(min_delay.saturating_mul(8))
            .with_max_times(config.continuation_retries);
        Self {
            dispatcher,
            backoff,
        }
    }

    /// Dispatch `request`; returns whether it was accepted.
    pub async fn fire(&self, request: &ContinuationRequest) -> bool {
        let result = (|| self.dispatcher.dispatch(request))
            .retry(self.backoff)
            .when(|err| !err.is_client_error())
            .notify(|err, delay| {
                warn!(
                    source_key = %request.source_key,
                    next_part_index = request.next_part_index,
                    error = %err,
                    ?delay,
                    "continuation dispatch failed, retrying"
                );
            })
            .await;

        match result {
            Ok(()) => {
                CONTINUATIONS.with_label_values(&["accepted"]).inc();
                info!(
                    source_key = %request.source_key,
                    next_part_index = request.next_part_index,
                    "continuation dispatched"
                );
                true
            }
            Err(err) => {
                CONTINUATIONS.with_label_values(&["failed"]).inc();
                let err = RelayError::ContinuationDispatch {
                    source_key:      request.source_key.clone(),
                    next_part_index: request.next_part_index,
                    message:         err.to_string(),
                };
                error!(error = %err, "session stalled");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jiff::SignedDuration;

    use super::*;

    struct Failing {
        status:        u16,
        attempts:      AtomicUsize,
        succeed_after: usize,
    }

    #[async_trait]
    impl ContinuationDispatcher for Failing {
        async fn dispatch(&self, _request: &ContinuationRequest) -> Result<(), RelayError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt >= self.succeed_after {
                return Ok(());
            }
            Err(RelayError::Destination {
                status: self.status,
                body:   "nope".to_string(),
            })
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            continuation_retries: 3,
            continuation_backoff: SignedDuration::from_millis(1),
            ..RelayConfig::default()
        }
    }

    fn request() -> ContinuationRequest {
        ContinuationRequest::builder()
            .source_key("https://example.com/a.bin")
            .notify_target("chat")
            .next_part_index(7)
            .session_id("s1")
            .build()
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dispatcher = Arc::new(Failing {
            status:        503,
            attempts:      AtomicUsize::new(0),
            succeed_after: 2,
        });
        let trigger = ContinuationTrigger::new(dispatcher.clone(), &config());
        assert!(trigger.fire(&request()).await);
        assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_stalls() {
        let dispatcher = Arc::new(Failing {
            status:        503,
            attempts:      AtomicUsize::new(0),
            succeed_after: usize::MAX,
        });
        let trigger = ContinuationTrigger::new(dispatcher.clone(), &config());
        assert!(!trigger.fire(&request()).await);
        assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let dispatcher = Arc::new(Failing {
            status:        409,
            attempts:      AtomicUsize::new(0),
            succeed_after: usize::MAX,
        });
        let trigger = ContinuationTrigger::new(dispatcher.clone(), &config());
        assert!(!trigger.fire(&request()).await);
        assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 1);
    }
}
