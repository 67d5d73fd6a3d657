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

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::{
    StatusCode,
    header::{self, HeaderMap},
};
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::{
    config::RelayConfig,
    error::{
        NetworkSnafu, RangeUnsupportedSnafu, RelayError, SourceSizeUnknownSnafu,
        SourceUnreachableSnafu,
    },
};

/// Byte stream of a source object, starting at the requested offset.
pub type ByteStream = BoxStream<'static, Result<Bytes, RelayError>>;

/// Metadata of a source object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMetadata {
    /// Size of the whole object, not of the requested range
    pub total_size:     u64,
    pub filename:       String,
    pub supports_range: bool,
    pub content_type:   Option<String>,
}

/// Opens byte-range reads against an HTTP source.
pub struct SourceReader {
    client:              reqwest::Client,
    buffer_ceiling:      u64,
    single_window_limit: u64,
}

impl SourceReader {
    pub fn new(client: reqwest::Client, config: &RelayConfig) -> Self {
        Self {
            client,
            buffer_ceiling: config.buffer_ceiling.as_bytes(),
            single_window_limit: config.single_window_limit.as_bytes(),
        }
    }

    /// Open `url` at `start_byte`.
    ///
    /// A fresh open (`start_byte == 0`) discovers the object's metadata and
    /// rejects sources that cannot be relayed before any byte is handed out.
    /// A resumed open issues `Range: bytes=<start_byte>-`.
    pub async fn open(
        &self,
        url: &str,
        start_byte: u64,
    ) -> Result<(SourceMetadata, ByteStream), RelayError> {
        if start_byte == 0 {
            self.open_fresh(url).await
        } else {
            self.open_resumed(url, start_byte).await
        }
    }

    async fn open_fresh(&self, url: &str) -> Result<(SourceMetadata, ByteStream), RelayError> {
        let probed = self.probe(url).await;

        let response = self.client.get(url).send().await.context(NetworkSnafu)?;
        ensure!(
            response.status().is_success(),
            SourceUnreachableSnafu {
                status: response.status().as_u16(),
                url,
            }
        );

        // HEAD answers win; the GET headers fill in whatever HEAD did not say.
        let headers = probed.as_ref().unwrap_or_else(|| response.headers());
        let size = content_length(headers).or_else(|| content_length(response.headers()));
        let supports_range = accepts_ranges(headers) || accepts_ranges(response.headers());
        let filename = disposition_filename(headers)
            .or_else(|| disposition_filename(response.headers()))
            .unwrap_or_else(|| filename_from_url(url));
        let content_type = media_type(headers).or_else(|| media_type(response.headers()));

        let (total_size, stream) = match size {
            Some(size) => (size, into_byte_stream(response)),
            None => {
                let body = self.buffer_unsized(url, response).await?;
                debug!(url, size = body.len(), "buffered source without Content-Length");
                (body.len() as u64, buffered_stream(body))
            }
        };

        ensure!(
            supports_range || total_size <= self.single_window_limit,
            RangeUnsupportedSnafu { url }
        );

        let metadata = SourceMetadata {
            total_size,
            filename,
            supports_range,
            content_type,
        };
        Ok((metadata, stream))
    }

    async fn open_resumed(
        &self,
        url: &str,
        start_byte: u64,
    ) -> Result<(SourceMetadata, ByteStream), RelayError> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, format!("bytes={start_byte}-"))
            .send()
            .await
            .context(NetworkSnafu)?;

        let status = response.status();
        // A 200 means the range was ignored and the body starts at byte 0.
        ensure!(status != StatusCode::OK, RangeUnsupportedSnafu { url });
        ensure!(
            status == StatusCode::PARTIAL_CONTENT,
            SourceUnreachableSnafu {
                status: status.as_u16(),
                url,
            }
        );

        let headers = response.headers();
        let total_size = content_range_total(headers)
            .or_else(|| content_length(headers).map(|len| len + start_byte))
            .unwrap_or_default();
        let metadata = SourceMetadata {
            total_size,
            filename: disposition_filename(headers).unwrap_or_else(|| filename_from_url(url)),
            supports_range: true,
            content_type: media_type(headers),
        };
        Ok((metadata, into_byte_stream(response)))
    }

    /// HEAD the source. Failures are not fatal: the GET response is used
    /// instead.
    async fn probe(&self, url: &str) -> Option<HeaderMap> {
        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => Some(response.headers().clone()),
            Ok(response) => {
                debug!(url, status = response.status().as_u16(), "HEAD rejected, using GET headers");
                None
            }
            Err(err) => {
                debug!(url, error = %err, "HEAD failed, using GET headers");
                None
            }
        }
    }

    /// Read a body of unknown length into memory, up to the buffering ceiling.
    async fn buffer_unsized(
        &self,
        url: &str,
        response: reqwest::Response,
    ) -> Result<Bytes, RelayError> {
        let mut stream = response.bytes_stream();
        let mut body = BytesMut::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context(NetworkSnafu)?;
            ensure!(
                (body.len() + chunk.len()) as u64 <= self.buffer_ceiling,
                SourceSizeUnknownSnafu {
                    url,
                    ceiling: self.buffer_ceiling,
                }
            );
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

fn into_byte_stream(response: reqwest::Response) -> ByteStream {
    response
        .bytes_stream()
        .map_err(|source| RelayError::Network { source })
        .boxed()
}

fn buffered_stream(body: Bytes) -> ByteStream {
    if body.is_empty() {
        return futures::stream::empty().boxed();
    }
    futures::stream::once(async move { Ok(body) }).boxed()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn accepts_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("bytes"))
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total size from `Content-Range: bytes <start>-<end>/<total>`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse().ok())
}

/// File name from `Content-Disposition`, preferring the RFC 5987
/// `filename*=` form.
fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())?;

    let mut plain = None;
    for param in value.split(';').map(str::trim) {
        if let Some(encoded) = param.strip_prefix("filename*=") {
            let encoded = encoded.rsplit("''").next().unwrap_or(encoded);
            let name = percent_decode(encoded.trim_matches('"'));
            if !name.is_empty() {
                return Some(name);
            }
        } else if let Some(name) = param.strip_prefix("filename=") {
            let name = name.trim_matches('"');
            if !name.is_empty() {
                plain = Some(name.to_string());
            }
        }
    }
    plain
}

/// Last non-empty path segment of `url`, or `"file"`.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(percent_decode))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "file".to_string())
}

fn percent_decode(input: &str) -> String {
    fn hex(byte: u8) -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'a'..=b'f' => Some(byte - b'a' + 10),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2]))
        {
            out.push((hi << 4) | lo);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
