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

use std::{
    fs::{self, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use fd_lock::RwLock;
use jiff::{SignedDuration, Timestamp};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tracing::warn;

use crate::{
    checkpoint::{CheckpointStore, apply_progress, apply_status_swap, stamp},
    error::{CheckpointCorruptedSnafu, CheckpointIoSnafu, RelayError},
    types::{SessionStatus, TransferSession},
};

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// One JSON file per session, named by the SHA-256 of its key.
///
/// Every write happens under an exclusive `fd-lock` on a sibling lock file
/// and lands through a rename, so readers never observe a torn checkpoint
/// and status swaps are atomic across processes sharing the directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    #[must_use]
    pub fn checkpoint_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{CHECKPOINT_SUFFIX}", hash_key(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf { self.dir.join(format!("{}.lock", hash_key(key))) }

    /// Run `f` on a blocking thread while holding the key's write lock.
    async fn locked<T, F>(&self, key: &str, f: F) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, RelayError> + Send + 'static,
    {
        let dir = self.dir.clone();
        let lock_path = self.lock_path(key);
        let path = self.checkpoint_path(key);

        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir).context(CheckpointIoSnafu { path: &dir })?;
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .context(CheckpointIoSnafu { path: &lock_path })?;
            let mut lock = RwLock::new(file);
            let _guard = lock.write().context(CheckpointIoSnafu { path: &lock_path })?;
            f(&path)
        })
        .await
        .map_err(|err| RelayError::TaskPanic {
            message: err.to_string(),
        })?
    }

    /// Read-modify-write the checkpoint at `key` under its lock.
    async fn update<F>(&self, key: &str, f: F) -> Result<bool, RelayError>
    where
        F: FnOnce(&mut TransferSession, i64) -> bool + Send + 'static,
    {
        let key_owned = key.to_string();
        self.locked(key, move |path| {
            let now = Timestamp::now().as_second();
            let Some(mut session) = read_checkpoint(path, &key_owned)? else {
                return Ok(false);
            };
            if session.is_expired(now) || !f(&mut session, now) {
                return Ok(false);
            }
            write_checkpoint(path, &session)?;
            Ok(true)
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<TransferSession>, RelayError> {
        let path = self.checkpoint_path(key);
        let key_owned = key.to_string();
        let session = tokio::task::spawn_blocking(move || read_checkpoint(&path, &key_owned))
            .await
            .map_err(|err| RelayError::TaskPanic {
                message: err.to_string(),
            })??;

        match session {
            Some(session) if session.is_expired(Timestamp::now().as_second()) => {
                // A fresh start may have replaced the entry since it was read.
                self.delete(key, &session.session_id).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(
        &self,
        key: &str,
        session: &TransferSession,
        ttl: SignedDuration,
    ) -> Result<(), RelayError> {
        let stamped = stamp(session, ttl, Timestamp::now().as_second());
        self.locked(key, move |path| write_checkpoint(path, &stamped)).await
    }

    async fn delete(&self, key: &str, session_id: &str) -> Result<bool, RelayError> {
        let key_owned = key.to_string();
        let session_id = session_id.to_string();
        self.locked(key, move |path| {
            let owned = read_checkpoint(path, &key_owned)?
                .is_some_and(|session| session.session_id == session_id);
            if !owned {
                return Ok(false);
            }
            match fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
                Err(err) => Err(err).context(CheckpointIoSnafu { path }),
            }
        })
        .await
    }

    async fn compare_and_swap_status(
        &self,
        key: &str,
        session_id: &str,
        expected: SessionStatus,
        new: SessionStatus,
    ) -> Result<bool, RelayError> {
        let session_id = session_id.to_string();
        self.update(key, move |session, now| {
            apply_status_swap(session, &session_id, expected, new, now)
        })
        .await
    }

    async fn record_progress(
        &self,
        key: &str,
        session_id: &str,
        resume_hint: u64,
    ) -> Result<bool, RelayError> {
        let session_id = session_id.to_string();
        self.update(key, move |session, now| {
            apply_progress(session, &session_id, resume_hint, now)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<TransferSession>, RelayError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || list_checkpoints(&dir))
            .await
            .map_err(|err| RelayError::TaskPanic {
                message: err.to_string(),
            })?
    }
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn read_checkpoint(path: &Path, key: &str) -> Result<Option<TransferSession>, RelayError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context(CheckpointIoSnafu { path }),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|_| CheckpointCorruptedSnafu { key }.build())
}

fn write_checkpoint(path: &Path, session: &TransferSession) -> Result<(), RelayError> {
    let json = serde_json::to_vec_pretty(session).map_err(|_| {
        CheckpointCorruptedSnafu {
            key: session.source_key.clone(),
        }
        .build()
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).context(CheckpointIoSnafu { path: &tmp })?;
    fs::rename(&tmp, path).context(CheckpointIoSnafu { path })
}

fn list_checkpoints(dir: &Path) -> Result<Vec<TransferSession>, RelayError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).context(CheckpointIoSnafu { path: dir }),
    };

    let now = Timestamp::now().as_second();
    let mut sessions = Vec::new();
    for entry in entries {
        let path = entry.context(CheckpointIoSnafu { path: dir })?.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(CHECKPOINT_SUFFIX));
        if !is_checkpoint {
            continue;
        }
        match read_checkpoint(&path, &path.display().to_string()) {
            Ok(Some(session)) if !session.is_expired(now) => sessions.push(session),
            Ok(_) => {}
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable checkpoint"),
        }
    }
    Ok(sessions)
}
