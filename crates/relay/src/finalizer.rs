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

use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{error, info, warn};

use crate::{
    checkpoint::CheckpointStore,
    destination::{BigObjectClient, ComposeAttributes},
    error::RelayError,
    types::{SessionStatus, TransferSession},
};

/// How the destination should present the composed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MediaKind {
    Document,
    Video,
    Audio,
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "webm", "avi", "m4v", "ts"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "flac", "ogg", "opus", "wav", "aac"];

impl MediaKind {
    /// Classify by file extension; anything unrecognized is a document.
    #[must_use]
    pub fn from_filename(filename: &str) -> Self {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
            Self::Video
        } else if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
            Self::Audio
        } else {
            Self::Document
        }
    }
}

/// Result of a finalize attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The object was composed and the checkpoint removed.
    Composed,
    /// Another invocation owns finalization; nothing was done.
    AlreadyClaimed,
}

/// Composes uploaded parts, at most once per session.
pub struct Finalizer {
    store:       Arc<dyn CheckpointStore>,
    destination: Arc<dyn BigObjectClient>,
}

impl Finalizer {
    pub fn new(store: Arc<dyn CheckpointStore>, destination: Arc<dyn BigObjectClient>) -> Self {
        Self { store, destination }
    }

    /// Claim the session with `Streaming -> Finalizing`, then compose.
    ///
    /// On compose failure the checkpoint is kept with status `Failed` and
    /// the destination's error is returned unchanged as
    /// [`RelayError::FinalizeFailure`].
    pub async fn finalize(&self, session: &TransferSession) -> Result<FinalizeOutcome, RelayError> {
        let key = session.source_key.as_str();
        let claimed = self
            .store
            .compare_and_swap_status(
                key,
                &session.session_id,
                SessionStatus::Streaming,
                SessionStatus::Finalizing,
            )
            .await?;
        if !claimed {
            info!(session_id = %session.session_id, "finalization already claimed");
            return Ok(FinalizeOutcome::AlreadyClaimed);
        }

        let attributes = ComposeAttributes {
            media_kind:   MediaKind::from_filename(&session.filename),
            filename:     session.filename.clone(),
            total_size:   session.total_size,
            content_type: session.content_type.clone(),
        };

        match self
            .destination
            .compose(
                &session.session_id,
                session.total_parts,
                &session.filename,
                &attributes,
            )
            .await
        {
            Ok(()) => {
                if let Err(err) = self.store.delete(key, &session.session_id).await {
                    // The object exists; a leftover checkpoint only lingers
                    // until its TTL.
                    warn!(session_id = %session.session_id, error = %err, "failed to delete checkpoint");
                }
                info!(
                    session_id = %session.session_id,
                    total_parts = session.total_parts,
                    "object composed"
                );
                Ok(FinalizeOutcome::Composed)
            }
            Err(err) => {
                let message = err.to_string();
                error!(session_id = %session.session_id, error = %message, "compose failed");
                if let Err(store_err) = self
                    .store
                    .compare_and_swap_status(
                        key,
                        &session.session_id,
                        SessionStatus::Finalizing,
                        SessionStatus::Failed,
                    )
                    .await
                {
                    warn!(session_id = %session.session_id, error = %store_err, "failed to mark session failed");
                }
                Err(RelayError::FinalizeFailure {
                    session_id: session.session_id.clone(),
                    message,
                })
            }
        }
    }
}
