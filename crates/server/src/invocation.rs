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

//! Invocation endpoint of the relay service.
//!
//! Fresh starts and continuations arrive here as the same JSON payload and
//! are queued for the worker; the response only acknowledges the enqueue.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    routing::{get, post},
};
use relay::{CheckpointStore, ContinuationRequest, RelayError, TaskQueue, TransferSession};
use serde::Serialize;
use snafu::{ResultExt, ensure};
use tracing::info;

use crate::{
    error::{ApiError, ApiResult, InternalSnafu, InvalidArgumentSnafu, UnauthorizedSnafu},
    http::RouteHandler,
};

pub const INVOCATIONS_PATH: &str = "/api/v1/relay/invocations";
pub const SESSIONS_PATH: &str = "/api/v1/relay/sessions";

#[derive(Clone)]
pub struct RelayState {
    queue:      TaskQueue,
    store:      Arc<dyn CheckpointStore>,
    /// Bearer token required on invocations, if set
    auth_token: Option<String>,
}

impl RelayState {
    pub fn new(queue: TaskQueue, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            queue,
            store,
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|token| !token.is_empty());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct InvocationAccepted {
    /// False when an identical request was already queued
    pub queued:          bool,
    pub source_key:      String,
    pub next_part_index: u64,
}

/// [`relay_routes`] bound to `state`, for [`crate::http::start_rest_server`].
pub fn route_handler(state: RelayState) -> RouteHandler {
    Box::new(move |router: Router| relay_routes(router, state.clone()))
}

/// Add the relay routes to `router`.
pub fn relay_routes(router: Router, state: RelayState) -> Router {
    router.merge(
        Router::new()
            .route(INVOCATIONS_PATH, post(invoke))
            .route(SESSIONS_PATH, get(list_sessions))
            .with_state(state),
    )
}

async fn invoke(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(request): Json<ContinuationRequest>,
) -> ApiResult<(StatusCode, Json<InvocationAccepted>)> {
    authorize(&state, &headers)?;
    ensure!(
        !request.source_key.trim().is_empty(),
        InvalidArgumentSnafu {
            reason: "source_key is required",
        }
    );
    ensure!(
        !request.notify_target.trim().is_empty(),
        InvalidArgumentSnafu {
            reason: "notify_target is required",
        }
    );

    let source_key = request.source_key.clone();
    let next_part_index = request.next_part_index;
    let queued = state.queue.enqueue(request).map_err(|err| match err {
        RelayError::QueueClosed => ApiError::Unavailable {
            reason: err.to_string(),
        },
        source => ApiError::Internal { source },
    })?;
    info!(%source_key, next_part_index, queued, "invocation accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(InvocationAccepted {
            queued,
            source_key,
            next_part_index,
        }),
    ))
}

async fn list_sessions(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<TransferSession>>> {
    authorize(&state, &headers)?;
    let sessions = state.store.list().await.context(InternalSnafu)?;
    Ok(Json(sessions))
}

fn authorize(state: &RelayState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.auth_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    ensure!(presented == Some(expected), UnauthorizedSnafu);
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum_test::TestServer;
    use relay::{MemoryCheckpointStore, TaskReceiver};
    use serde_json::{Value, json};

    use super::*;

    fn server(token: Option<&str>) -> (TestServer, TaskReceiver, Arc<MemoryCheckpointStore>) {
        let (queue, receiver) = TaskQueue::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let state = RelayState::new(queue, store.clone()).with_auth_token(token.map(String::from));
        let app = relay_routes(Router::new(), state);
        let server = TestServer::builder()
            .try_build(app)
            .expect("failed to create test server");
        (server, receiver, store)
    }

    fn fresh() -> Value {
        json!({
            "source_key": "https://example.com/video.mp4",
            "notify_target": "chat-42",
        })
    }

    #[tokio::test]
    async fn test_invocation_is_queued_once() {
        let (server, _receiver, _store) = server(None);

        let response = server.post(INVOCATIONS_PATH).json(&fresh()).await;
        response.assert_status(StatusCode::ACCEPTED);
        let body: Value = response.json();
        assert_eq!(body["queued"], true);
        assert_eq!(body["next_part_index"], 0);

        let response = server.post(INVOCATIONS_PATH).json(&fresh()).await;
        response.assert_status(StatusCode::ACCEPTED);
        assert_eq!(response.json::<Value>()["queued"], false);
    }

    #[tokio::test]
    async fn test_missing_notify_target_is_rejected() {
        let (server, _receiver, _store) = server(None);

        let response = server
            .post(INVOCATIONS_PATH)
            .json(&json!({"source_key": "https://example.com/a.bin", "notify_target": ""}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Value>()["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn test_closed_queue_is_unavailable() {
        let (server, receiver, _store) = server(None);
        drop(receiver);

        let response = server.post(INVOCATIONS_PATH).json(&fresh()).await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_token_is_enforced() {
        let (server, _receiver, _store) = server(Some("secret"));

        let response = server.post(INVOCATIONS_PATH).json(&fresh()).await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post(INVOCATIONS_PATH)
            .authorization_bearer("secret")
            .json(&fresh())
            .await;
        response.assert_status(StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_sessions_are_listed() {
        let (server, _receiver, store) = server(None);
        let session: TransferSession = serde_json::from_value(json!({
            "session_id": "s1",
            "source_key": "https://example.com/a.bin",
            "total_size": 10,
            "part_size": 4,
            "total_parts": 3,
            "filename": "a.bin",
            "content_type": null,
            "supports_range": true,
            "status": "streaming",
            "notify_target": "chat-42",
            "status_handle": null,
            "created_at": 0,
            "updated_at": 0,
            "expires_at": 0,
        }))
        .unwrap();
        store
            .put(&session.source_key, &session, jiff::SignedDuration::from_hours(1))
            .await
            .unwrap();

        let response = server.get(SESSIONS_PATH).await;
        response.assert_status_ok();
        let body: Vec<Value> = response.json();
        assert_eq!(body.len(), 1);
        assert_eq!(body[0]["session_id"], "s1");
    }
}
