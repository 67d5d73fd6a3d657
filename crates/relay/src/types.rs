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

use bon::Builder;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Persisted status of a session. `Done` is never stored: a finalized
/// session's checkpoint is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    /// Parts are being uploaded, possibly across several invocations
    Streaming,
    /// One invocation won the right to compose the uploaded parts
    Finalizing,
    /// Terminal failure; the checkpoint is kept for inspection
    Failed,
}

/// Checkpointed state of one relay job.
///
/// The resumption cursor is not part of the session: it travels in the
/// [`ContinuationRequest`]. `resume_hint` only exists so the reaper can
/// re-dispatch a stalled session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSession {
    /// Destination upload-session handle, assigned once per fresh start
    pub session_id:     String,
    /// Source URL, also the checkpoint key
    pub source_key:     String,
    /// Total byte length of the source object
    pub total_size:     u64,
    /// Part size frozen at session creation
    pub part_size:      u64,
    /// `ceil(total_size / part_size)`
    pub total_parts:    u64,
    /// File name advertised to the destination
    pub filename:       String,
    /// Content type reported by the source, if any
    pub content_type:   Option<String>,
    /// Whether the source honours `Range`. Sessions without it cannot be
    /// resumed and run in a single window.
    pub supports_range: bool,
    pub status:         SessionStatus,
    /// Where progress and terminal reports go
    pub notify_target:  String,
    /// Handle of the status message being edited, if one was sent
    pub status_handle:  Option<String>,
    /// Last `next_part_index` handed off to a continuation
    #[serde(default)]
    pub resume_hint:    u64,
    /// Unix timestamp when the session was created
    pub created_at:     i64,
    /// Unix timestamp of the last checkpoint write
    pub updated_at:     i64,
    /// Unix timestamp after which the checkpoint is ignored
    pub expires_at:     i64,
}

impl TransferSession {
    /// Length of the part at `index`; zero past the end.
    #[must_use]
    pub fn part_len(&self, index: u64) -> u64 { part_len(self.total_size, self.part_size, index) }

    /// Byte offset where the part at `index` begins.
    #[must_use]
    pub const fn start_byte(&self, index: u64) -> u64 { index.saturating_mul(self.part_size) }

    #[must_use]
    pub const fn is_expired(&self, now: i64) -> bool { self.expires_at <= now }

    /// Continuation that resumes this session at `next_part_index`.
    #[must_use]
    pub fn continuation(&self, next_part_index: u64) -> ContinuationRequest {
        ContinuationRequest {
            source_key: self.source_key.clone(),
            notify_target: self.notify_target.clone(),
            next_part_index,
            status_handle: self.status_handle.clone(),
            session_id: Some(self.session_id.clone()),
        }
    }
}

/// A contiguous slice of the source object with a stable index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// 0-based part index
    pub index: u64,
    pub data:  Bytes,
}

impl Part {
    #[must_use]
    pub fn len(&self) -> u64 { self.data.len() as u64 }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
}

/// Payload of one invocation of the engine.
///
/// A fresh start has no `session_id` and `next_part_index == 0`; every
/// continuation carries the id of the session it resumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Builder)]
pub struct ContinuationRequest {
    #[builder(into)]
    pub source_key:      String,
    #[builder(into)]
    pub notify_target:   String,
    #[builder(default)]
    #[serde(default)]
    pub next_part_index: u64,
    #[builder(into)]
    #[serde(default)]
    pub status_handle:   Option<String>,
    #[builder(into)]
    #[serde(default)]
    pub session_id:      Option<String>,
}

impl ContinuationRequest {
    #[must_use]
    pub const fn is_fresh_start(&self) -> bool { self.session_id.is_none() }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every part was uploaded and composed; the checkpoint is gone.
    Completed {
        session_id:  String,
        total_parts: u64,
        total_size:  u64,
    },
    /// The execution budget ran out. `dispatched` is false when every
    /// continuation attempt failed and the session is stalled.
    Suspended {
        session_id:      String,
        next_part_index: u64,
        dispatched:      bool,
    },
    /// Another invocation already claimed finalization of this session.
    AlreadyFinalizing { session_id: String },
}

/// Number of parts needed for `total_size` bytes.
#[must_use]
pub const fn total_parts(total_size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    total_size.div_ceil(part_size)
}

/// Length of the part at `index`: `part_size` except for the last part.
#[must_use]
pub fn part_len(total_size: u64, part_size: u64, index: u64) -> u64 {
    let start = index.saturating_mul(part_size);
    if start >= total_size {
        return 0;
    }
    (total_size - start).min(part_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_parts_example() {
        assert_eq!(total_parts(2_000_000, 524_288), 4);
        let lengths: Vec<u64> = (0..4).map(|i| part_len(2_000_000, 524_288, i)).collect();
        assert_eq!(lengths, vec![524_288, 524_288, 524_288, 427_136]);
    }

    #[test]
    fn test_part_lengths_sum_to_total() {
        for (total, part) in [(1, 1), (10, 3), (4096, 1024), (1_000_003, 65_536), (7, 100)] {
            let parts = total_parts(total, part);
            assert_eq!(parts, total.div_ceil(part));
            let sum: u64 = (0..parts).map(|i| part_len(total, part, i)).sum();
            assert_eq!(sum, total, "total={total} part={part}");
        }
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        assert_eq!(SessionStatus::Finalizing.to_string(), "finalizing");
        assert_eq!("failed".parse::<SessionStatus>().unwrap(), SessionStatus::Failed);
    }

    #[test]
    fn test_continuation_request_defaults() {
        let request: ContinuationRequest = serde_json::from_str(
            r#"{"source_key":"https://example.com/a.bin","notify_target":"chat-1"}"#,
        )
        .unwrap();
        assert!(request.is_fresh_start());
        assert_eq!(request.next_part_index, 0);

        let built = ContinuationRequest::builder()
            .source_key("https://example.com/a.bin")
            .notify_target("chat-1")
            .build();
        assert_eq!(built, request);
    }
}
