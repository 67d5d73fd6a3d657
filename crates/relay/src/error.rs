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

use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RelayError {
    #[snafu(display("Configuration error: {message}"))]
    Config { message: String },

    #[snafu(display("Invalid relay request: {message}"))]
    InvalidRequest { message: String },

    #[snafu(display("Network error: {source}"))]
    Network { source: reqwest::Error },

    #[snafu(display("Source unreachable: HTTP {status} for URL: {url}"))]
    SourceUnreachable { status: u16, url: String },

    #[snafu(display(
        "Source does not support Range requests, cannot relay {url} across execution windows"
    ))]
    RangeUnsupported { url: String },

    #[snafu(display(
        "Source did not report its size and the body exceeds the {ceiling} byte buffering \
         ceiling: {url}"
    ))]
    SourceSizeUnknown { url: String, ceiling: u64 },

    #[snafu(display("Source is empty: {url}"))]
    EmptySource { url: String },

    #[snafu(display("Source size mismatch for {url}: expected {expected} bytes, got {actual}"))]
    SourceSizeMismatch {
        url:      String,
        expected: u64,
        actual:   u64,
    },

    #[snafu(display("Destination rejected request: HTTP {status}: {body}"))]
    Destination { status: u16, body: String },

    #[snafu(display("Part {index} of session {session_id} failed after {attempts} attempts: {message}"))]
    UploadPartFailure {
        session_id: String,
        index:      u64,
        attempts:   usize,
        message:    String,
    },

    #[snafu(display("Continuation dispatch for {source_key} at part {next_part_index} failed: {message}"))]
    ContinuationDispatch {
        source_key:      String,
        next_part_index: u64,
        message:         String,
    },

    /// Compose failed; `message` is the destination's error, unchanged.
    #[snafu(display("{message}"))]
    FinalizeFailure { session_id: String, message: String },

    #[snafu(display("Checkpoint store I/O error at {}: {source}", path.display()))]
    CheckpointIo {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Checkpoint for {key} is corrupted"))]
    CheckpointCorrupted { key: String },

    #[snafu(display("No checkpoint found for {source_key}"))]
    SessionNotFound { source_key: String },

    #[snafu(display("Session {expected} for {source_key} was replaced by {actual}"))]
    SessionMismatch {
        source_key: String,
        expected:   String,
        actual:     String,
    },

    #[snafu(display("Session {session_id} for {source_key} already failed"))]
    SessionFailed {
        source_key: String,
        session_id: String,
    },

    #[snafu(display("Task queue is closed"))]
    QueueClosed,

    #[snafu(display("Notification failed: {message}"))]
    Notify { message: String },

    #[snafu(display("Task panicked: {message}"))]
    TaskPanic { message: String },
}

impl RelayError {
    /// Errors that reject a stale or malformed invocation without touching the
    /// session it names. They are not reported to the notify target.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. }
                | Self::SessionNotFound { .. }
                | Self::SessionMismatch { .. }
                | Self::SessionFailed { .. }
        )
    }

    /// Client-side HTTP failures are never retried.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Destination { status, .. } | Self::SourceUnreachable { status, .. }
                if *status >= 400 && *status < 500
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_failure_is_verbatim() {
        let err = RelayError::FinalizeFailure {
            session_id: "s1".to_string(),
            message:    "FILE_PARTS_INVALID".to_string(),
        };
        assert_eq!(err.to_string(), "FILE_PARTS_INVALID");
    }

    #[test]
    fn test_rejection_classification() {
        let stale = RelayError::SessionMismatch {
            source_key: "https://example.com/a.bin".to_string(),
            expected:   "old".to_string(),
            actual:     "new".to_string(),
        };
        assert!(stale.is_rejection());

        let failed = RelayError::RangeUnsupported {
            url: "https://example.com/a.bin".to_string(),
        };
        assert!(!failed.is_rejection());
    }

    #[test]
    fn test_client_error() {
        let err = RelayError::Destination {
            status: 400,
            body:   "bad part".to_string(),
        };
        assert!(err.is_client_error());
        let err = RelayError::Destination {
            status: 503,
            body:   "busy".to_string(),
        };
        assert!(!err.is_client_error());
    }
}
