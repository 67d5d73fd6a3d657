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

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tracing::info;

use crate::error::{ConfigSnafu, NotifySnafu, RelayError};

/// Channel reaching whoever asked for a relay.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post a new message; returns a handle for later edits.
    async fn send(&self, target: &str, text: &str) -> Result<String, RelayError>;

    /// Replace the text of a message sent earlier.
    async fn edit(&self, target: &str, handle: &str, text: &str) -> Result<(), RelayError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, target: &str, text: &str) -> Result<String, RelayError> {
        let handle = uuid::Uuid::new_v4().to_string();
        info!(target_id = target, handle = %handle, text, "notify");
        Ok(handle)
    }

    async fn edit(&self, target: &str, handle: &str, text: &str) -> Result<(), RelayError> {
        info!(target_id = target, handle, text, "notify edit");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    target: &'a str,
    text:   &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct WebhookReply {
    handle: String,
}

/// Posts notifications as JSON to a webhook.
///
/// `send` expects `{"handle": "..."}` back; `edit` re-posts with the handle
/// set.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url:    String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Result<Self, RelayError> {
        let url = url.into();
        ensure!(
            !url.is_empty(),
            ConfigSnafu {
                message: "notify webhook url is required",
            }
        );
        Ok(Self { client, url })
    }

    async fn post(&self, message: &WebhookMessage<'_>) -> Result<reqwest::Response, RelayError> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|err| RelayError::Notify {
                message: err.to_string(),
            })?;
        ensure!(
            response.status().is_success(),
            NotifySnafu {
                message: format!("webhook answered HTTP {}", response.status().as_u16()),
            }
        );
        Ok(response)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, target: &str, text: &str) -> Result<String, RelayError> {
        let response = self
            .post(&WebhookMessage {
                target,
                text,
                handle: None,
            })
            .await?;
        let reply: WebhookReply = response.json().await.map_err(|err| RelayError::Notify {
            message: err.to_string(),
        })?;
        Ok(reply.handle)
    }

    async fn edit(&self, target: &str, handle: &str, text: &str) -> Result<(), RelayError> {
        self.post(&WebhookMessage {
            target,
            text,
            handle: Some(handle),
        })
        .await
        .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, routing::post};
    use axum_test::TestServer;
    use serde_json::{Value, json};

    use super::*;

    async fn webhook(Json(body): Json<Value>) -> Json<Value> {
        let handle = body
            .get("handle")
            .and_then(Value::as_str)
            .unwrap_or("msg-1")
            .to_string();
        Json(json!({ "handle": handle }))
    }

    #[tokio::test]
    async fn test_webhook_send_and_edit() {
        let app = Router::new().route("/hook", post(webhook));
        let server = TestServer::builder().http_transport().try_build(app).unwrap();
        let base = server.server_address().unwrap().to_string();
        let url = format!("{}/hook", base.trim_end_matches('/'));

        let notifier = WebhookNotifier::new(reqwest::Client::new(), url).unwrap();
        let handle = notifier.send("chat-1", "starting").await.unwrap();
        assert_eq!(handle, "msg-1");
        notifier.edit("chat-1", &handle, "50%").await.unwrap();
    }

    #[tokio::test]
    async fn test_log_notifier_hands_out_handles() {
        let handle = LogNotifier.send("chat-1", "hello").await.unwrap();
        assert!(!handle.is_empty());
        LogNotifier.edit("chat-1", &handle, "bye").await.unwrap();
    }
}
