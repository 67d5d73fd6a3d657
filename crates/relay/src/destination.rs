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
use bytes::Bytes;
use reqwest::header;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::{
    error::{ConfigSnafu, DestinationSnafu, NetworkSnafu, RelayError},
    finalizer::MediaKind,
};

/// Attributes sent along with the compose call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeAttributes {
    pub media_kind:   MediaKind,
    pub filename:     String,
    pub total_size:   u64,
    pub content_type: Option<String>,
}

/// Destination speaking a part-indexed upload protocol.
///
/// Uploading the same part index twice overwrites the earlier upload, so
/// `save_part` may be retried freely.
#[async_trait]
pub trait BigObjectClient: Send + Sync {
    async fn save_part(
        &self,
        session_id: &str,
        part_index: u64,
        total_parts: u64,
        data: Bytes,
    ) -> Result<(), RelayError>;

    /// Assemble parts `0..total_parts` into the final object.
    async fn compose(
        &self,
        session_id: &str,
        total_parts: u64,
        filename: &str,
        attributes: &ComposeAttributes,
    ) -> Result<(), RelayError>;
}

#[derive(Serialize)]
struct ComposeBody<'a> {
    total_parts: u64,
    filename:    &'a str,
    attributes:  &'a ComposeAttributes,
}

/// [`BigObjectClient`] over HTTP with bearer authentication.
///
/// - `PUT {base}/uploads/{session}/parts/{index}?total_parts={n}` with the
///   raw part as body
/// - `POST {base}/uploads/{session}/compose` with a JSON body
pub struct HttpBigObjectClient {
    client:   reqwest::Client,
    base_url: String,
    token:    String,
}

impl HttpBigObjectClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, RelayError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let token = token.into();
        ensure!(
            !base_url.is_empty(),
            ConfigSnafu {
                message: "destination base_url is required",
            }
        );
        ensure!(
            !token.is_empty(),
            ConfigSnafu {
                message: "destination token is required",
            }
        );
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    async fn check(response: reqwest::Response) -> Result<(), RelayError> {
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

#[async_trait]
impl BigObjectClient for HttpBigObjectClient {
    async fn save_part(
        &self,
        session_id: &str,
        part_index: u64,
        total_parts: u64,
        data: Bytes,
    ) -> Result<(), RelayError> {
        let url = format!(
            "{}/uploads/{session_id}/parts/{part_index}?total_parts={total_parts}",
            self.base_url
        );
        debug!(session_id, part_index, len = data.len(), "saving part");
        let response = self
            .client
            .put(url)
            .bearer_auth(&self.token)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .context(NetworkSnafu)?;
        Self::check(response).await
    }

    async fn compose(
        &self,
        session_id: &str,
        total_parts: u64,
        filename: &str,
        attributes: &ComposeAttributes,
    ) -> Result<(), RelayError> {
        let url = format!("{}/uploads/{session_id}/compose", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&ComposeBody {
                total_parts,
                filename,
                attributes,
            })
            .send()
            .await
            .context(NetworkSnafu)?;
        Self::check(response).await
    }
}
