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

#![allow(dead_code)]

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_test::TestServer;
use jiff::SignedDuration;
use relay::{
    BigObjectClient, CheckpointStore, ComposeAttributes, ContinuationDispatcher,
    ContinuationRequest, ManualClock, Notifier, RelayConfig, RelayError, SessionRunner,
};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Source server

#[derive(Clone)]
pub struct SourceState {
    pub content:        Arc<RwLock<Arc<Vec<u8>>>>,
    pub accept_ranges:  bool,
    pub content_length: bool,
    pub filename:       Option<&'static str>,
    /// Answer every request with this status instead of the content
    pub fail_with:      Option<StatusCode>,
    pub gets:           Arc<AtomicUsize>,
}

impl SourceState {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content:        Arc::new(RwLock::new(Arc::new(content))),
            accept_ranges:  true,
            content_length: true,
            filename:       Some("movie.mp4"),
            fail_with:      None,
            gets:           Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Swap the object served from now on, as if it changed upstream.
    pub fn replace_content(&self, content: Vec<u8>) {
        *self.content.write().unwrap() = Arc::new(content);
    }
}

async fn handle_get(headers: HeaderMap, State(state): State<SourceState>) -> Response {
    state.gets.fetch_add(1, Ordering::SeqCst);
    if let Some(status) = state.fail_with {
        return status.into_response();
    }
    let content = state.content.read().unwrap().clone();
    let total = content.len();

    let mut response_headers = HeaderMap::new();
    if let Some(filename) = state.filename {
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")).unwrap(),
        );
    }

    let range_start = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range_start);

    if state.accept_ranges {
        response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some(start) = range_start {
            if start >= total {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{}/{total}", total - 1)).unwrap(),
            );
            return (
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                Bytes::copy_from_slice(&content[start..]),
            )
                .into_response();
        }
    }

    if state.content_length {
        return (
            StatusCode::OK,
            response_headers,
            Bytes::copy_from_slice(&content),
        )
            .into_response();
    }

    let chunks: Vec<Result<Bytes, Infallible>> = content
        .chunks(8 * 1024)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    (
        StatusCode::OK,
        response_headers,
        Body::from_stream(futures::stream::iter(chunks)),
    )
        .into_response()
}

/// Start of a `bytes=<start>-[<end>]` range.
fn parse_range_start(value: &str) -> Option<usize> {
    let value = value.strip_prefix("bytes=")?;
    let (start, _) = value.split_once('-')?;
    start.parse().ok()
}

pub fn source_server(state: SourceState) -> TestServer {
    let app = Router::new()
        .route("/files/movie.mp4", get(handle_get))
        .with_state(state);

    TestServer::builder()
        .http_transport()
        .try_build(app)
        .expect("failed to create source server")
}

pub fn source_url(server: &TestServer) -> String {
    let base = server
        .server_address()
        .expect("server should have HTTP address")
        .to_string();
    format!("{}/files/movie.mp4", base.trim_end_matches('/'))
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 7) % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Destination

#[derive(Debug, Clone)]
pub struct Composed {
    pub session_id:  String,
    pub total_parts: u64,
    pub attributes:  ComposeAttributes,
    pub data:        Vec<u8>,
}

/// Records parts and assembles them on compose.
#[derive(Default)]
pub struct MemoryDestination {
    pub parts:         Mutex<HashMap<(String, u64), Bytes>>,
    pub part_attempts: AtomicUsize,
    pub composed:      Mutex<Vec<Composed>>,
    /// Part index -> number of attempts to fail
    pub fail_parts:    Mutex<HashMap<u64, usize>>,
    pub compose_error: Option<String>,
    /// Advance this clock on every part upload
    pub slow_clock:    Option<(Arc<ManualClock>, SignedDuration)>,
}

impl MemoryDestination {
    pub async fn part_count(&self) -> usize { self.parts.lock().await.len() }

    pub async fn single_object(&self) -> Composed {
        let composed = self.composed.lock().await;
        assert_eq!(composed.len(), 1, "expected exactly one composed object");
        composed[0].clone()
    }
}

#[async_trait]
impl BigObjectClient for MemoryDestination {
    async fn save_part(
        &self,
        session_id: &str,
        part_index: u64,
        _total_parts: u64,
        data: Bytes,
    ) -> Result<(), RelayError> {
        self.part_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some((clock, step)) = &self.slow_clock {
            clock.advance(*step);
        }

        {
            let mut failures = self.fail_parts.lock().await;
            if let Some(left) = failures.get_mut(&part_index)
                && *left > 0
            {
                *left -= 1;
                return Err(RelayError::Destination {
                    status: 500,
                    body:   "transient".to_string(),
                });
            }
        }

        self.parts
            .lock()
            .await
            .insert((session_id.to_string(), part_index), data);
        Ok(())
    }

    async fn compose(
        &self,
        session_id: &str,
        total_parts: u64,
        _filename: &str,
        attributes: &ComposeAttributes,
    ) -> Result<(), RelayError> {
        if let Some(message) = &self.compose_error {
            return Err(RelayError::Destination {
                status: 400,
                body:   message.clone(),
            });
        }

        let parts = self.parts.lock().await;
        let mut data = Vec::new();
        for index in 0..total_parts {
            let part = parts
                .get(&(session_id.to_string(), index))
                .ok_or_else(|| RelayError::Destination {
                    status: 400,
                    body:   format!("missing part {index}"),
                })?;
            data.extend_from_slice(part);
        }

        self.composed.lock().await.push(Composed {
            session_id: session_id.to_string(),
            total_parts,
            attributes: attributes.clone(),
            data,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher and notifier

#[derive(Default)]
pub struct RecordingDispatcher {
    pub requests: Mutex<Vec<ContinuationRequest>>,
}

impl RecordingDispatcher {
    pub async fn last(&self) -> Option<ContinuationRequest> {
        self.requests.lock().await.last().cloned()
    }
}

#[async_trait]
impl ContinuationDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: &ContinuationRequest) -> Result<(), RelayError> {
        self.requests.lock().await.push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub async fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, target: &str, text: &str) -> Result<String, RelayError> {
        self.messages
            .lock()
            .await
            .push((target.to_string(), text.to_string()));
        Ok("status-1".to_string())
    }

    async fn edit(&self, target: &str, _handle: &str, text: &str) -> Result<(), RelayError> {
        self.messages
            .lock()
            .await
            .push((target.to_string(), text.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring

pub fn test_config() -> RelayConfig {
    RelayConfig {
        part_size: relayer_base::readable_size::ReadableSize::kb(64),
        parallel_uploads: 3,
        continuation_backoff: SignedDuration::from_millis(1),
        ..RelayConfig::default()
    }
}

pub struct Harness {
    pub runner:      SessionRunner,
    pub store:       Arc<dyn CheckpointStore>,
    pub destination: Arc<MemoryDestination>,
    pub dispatcher:  Arc<RecordingDispatcher>,
    pub notifier:    Arc<RecordingNotifier>,
    pub clock:       Arc<ManualClock>,
}

pub fn harness(
    config: RelayConfig,
    store: Arc<dyn CheckpointStore>,
    destination: MemoryDestination,
    clock: Arc<ManualClock>,
) -> Harness {
    relayer_common_telemetry::init_default_ut_logging();

    let destination = Arc::new(destination);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let runner = SessionRunner::builder()
        .config(config)
        .store(store.clone())
        .destination(destination.clone())
        .dispatcher(dispatcher.clone())
        .notifier(notifier.clone())
        .clock(clock.clone())
        .build()
        .expect("failed to build runner");

    Harness {
        runner,
        store,
        destination,
        dispatcher,
        notifier,
        clock,
    }
}

pub fn fresh_request(url: &str) -> ContinuationRequest {
    ContinuationRequest::builder()
        .source_key(url)
        .notify_target("chat-42")
        .build()
}
