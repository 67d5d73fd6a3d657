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

//! Durable session checkpoints.
//!
//! `get` and `put` are last-write-wins. `delete` and the two conditional
//! updates are atomic per key and only touch the session they name: they are
//! what keeps a duplicated invocation from finalizing twice, reviving a
//! replaced session or removing its successor's checkpoint.

use std::collections::HashMap;

use async_trait::async_trait;
use jiff::{SignedDuration, Timestamp};
use tokio::sync::Mutex;

use crate::{
    error::RelayError,
    types::{SessionStatus, TransferSession},
};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The live checkpoint for `key`; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<TransferSession>, RelayError>;

    /// Store `session` under `key`, stamping `updated_at` and `expires_at`.
    async fn put(
        &self,
        key: &str,
        session: &TransferSession,
        ttl: SignedDuration,
    ) -> Result<(), RelayError>;

    /// Remove the checkpoint iff the stored session is `session_id`.
    /// Returns whether it did.
    async fn delete(&self, key: &str, session_id: &str) -> Result<bool, RelayError>;

    /// Move the session from `expected` to `new` iff the stored session has
    /// id `session_id` and status `expected`. Returns whether it did.
    async fn compare_and_swap_status(
        &self,
        key: &str,
        session_id: &str,
        expected: SessionStatus,
        new: SessionStatus,
    ) -> Result<bool, RelayError>;

    /// Record a hand-off at `resume_hint` and refresh `updated_at`, iff the
    /// stored session is `session_id` and still streaming.
    async fn record_progress(
        &self,
        key: &str,
        session_id: &str,
        resume_hint: u64,
    ) -> Result<bool, RelayError>;

    /// Every live checkpoint.
    async fn list(&self) -> Result<Vec<TransferSession>, RelayError>;
}

/// Apply a CAS to `session` in place. Shared by the store implementations.
pub(crate) fn apply_status_swap(
    session: &mut TransferSession,
    session_id: &str,
    expected: SessionStatus,
    new: SessionStatus,
    now: i64,
) -> bool {
    if session.session_id != session_id || session.status != expected {
        return false;
    }
    session.status = new;
    session.updated_at = now;
    true
}

pub(crate) fn apply_progress(
    session: &mut TransferSession,
    session_id: &str,
    resume_hint: u64,
    now: i64,
) -> bool {
    if session.session_id != session_id || session.status != SessionStatus::Streaming {
        return false;
    }
    session.resume_hint = resume_hint;
    session.updated_at = now;
    true
}

pub(crate) fn stamp(session: &TransferSession, ttl: SignedDuration, now: i64) -> TransferSession {
    let mut stamped = session.clone();
    stamped.updated_at = now;
    stamped.expires_at = now.saturating_add(ttl.as_secs());
    stamped
}

/// In-process store for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, TransferSession>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<TransferSession>, RelayError> {
        let now = Timestamp::now().as_second();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(session) if session.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            other => Ok(other.cloned()),
        }
    }

    async fn put(
        &self,
        key: &str,
        session: &TransferSession,
        ttl: SignedDuration,
    ) -> Result<(), RelayError> {
        let stamped = stamp(session, ttl, Timestamp::now().as_second());
        self.entries.lock().await.insert(key.to_string(), stamped);
        Ok(())
    }

    async fn delete(&self, key: &str, session_id: &str) -> Result<bool, RelayError> {
        let mut entries = self.entries.lock().await;
        if !entries
            .get(key)
            .is_some_and(|session| session.session_id == session_id)
        {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn compare_and_swap_status(
        &self,
        key: &str,
        session_id: &str,
        expected: SessionStatus,
        new: SessionStatus,
    ) -> Result<bool, RelayError> {
        let now = Timestamp::now().as_second();
        let mut entries = self.entries.lock().await;
        Ok(entries
            .get_mut(key)
            .filter(|session| !session.is_expired(now))
            .is_some_and(|session| apply_status_swap(session, session_id, expected, new, now)))
    }

    async fn record_progress(
        &self,
        key: &str,
        session_id: &str,
        resume_hint: u64,
    ) -> Result<bool, RelayError> {
        let now = Timestamp::now().as_second();
        let mut entries = self.entries.lock().await;
        Ok(entries
            .get_mut(key)
            .filter(|session| !session.is_expired(now))
            .is_some_and(|session| apply_progress(session, session_id, resume_hint, now)))
    }

    async fn list(&self) -> Result<Vec<TransferSession>, RelayError> {
        let now = Timestamp::now().as_second();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, session| !session.is_expired(now));
        Ok(entries.values().cloned().collect())
    }
}
