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

use std::{sync::Arc, time::Duration};

use backon::{ConstantBuilder, Retryable};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    destination::BigObjectClient,
    error::RelayError,
    metrics::{BYTES_RELAYED, PART_RETRIES, PARTS_UPLOADED},
    types::Part,
};

/// One immediate retry after the first failure.
const PART_RETRIES_ALLOWED: usize = 1;

/// Uploads parts to the destination.
pub struct PartUploader {
    destination: Arc<dyn BigObjectClient>,
}

impl PartUploader {
    pub fn new(destination: Arc<dyn BigObjectClient>) -> Self { Self { destination } }

    /// Upload one part, retrying once immediately on failure.
    pub async fn upload(
        &self,
        session_id: &str,
        total_parts: u64,
        part: &Part,
    ) -> Result<(), RelayError> {
        let backoff = ConstantBuilder::default()
            .with_delay(Duration::ZERO)
            .with_max_times(PART_RETRIES_ALLOWED);

        (|| {
            self.destination
                .save_part(session_id, part.index, total_parts, part.data.clone())
        })
        .retry(backoff)
        .notify(|err, _| {
            PART_RETRIES.inc();
            warn!(session_id, part_index = part.index, error = %err, "part upload failed, retrying");
        })
        .await
        .map_err(|err| RelayError::UploadPartFailure {
            session_id: session_id.to_string(),
            index:      part.index,
            attempts:   PART_RETRIES_ALLOWED + 1,
            message:    err.to_string(),
        })?;

        PARTS_UPLOADED.inc();
        BYTES_RELAYED.inc_by(part.len());
        debug!(session_id, part_index = part.index, "part uploaded");
        Ok(())
    }

    /// Upload a closed batch concurrently and wait for every upload to
    /// resolve. The first failure, by part order, is returned.
    pub async fn upload_batch(
        &self,
        session_id: &str,
        total_parts: u64,
        batch: &[Part],
    ) -> Result<(), RelayError> {
        let results =
            join_all(batch.iter().map(|part| self.upload(session_id, total_parts, part))).await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Mutex;

    use super::*;
    use crate::destination::ComposeAttributes;

    /// Fails each listed part index the given number of times.
    #[derive(Default)]
    struct FlakyDestination {
        failures: Mutex<HashMap<u64, usize>>,
        attempts: AtomicUsize,
        saved:    Mutex<HashMap<u64, Bytes>>,
    }

    #[async_trait]
    impl BigObjectClient for FlakyDestination {
        async fn save_part(
            &self,
            _session_id: &str,
            part_index: u64,
            _total_parts: u64,
            data: Bytes,
        ) -> Result<(), RelayError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().await;
            if let Some(left) = failures.get_mut(&part_index)
                && *left > 0
            {
                *left -= 1;
                return Err(RelayError::Destination {
                    status: 503,
                    body:   "busy".to_string(),
                });
            }
            self.saved.lock().await.insert(part_index, data);
            Ok(())
        }

        async fn compose(
            &self,
            _session_id: &str,
            _total_parts: u64,
            _filename: &str,
            _attributes: &ComposeAttributes,
        ) -> Result<(), RelayError> {
            Ok(())
        }
    }

    fn part(index: u64) -> Part {
        Part {
            index,
            data: Bytes::from(vec![index as u8; 8]),
        }
    }

    #[tokio::test]
    async fn test_single_failure_is_retried() {
        let destination = Arc::new(FlakyDestination::default());
        destination.failures.lock().await.insert(1, 1);
        let uploader = PartUploader::new(destination.clone());

        uploader.upload("s", 3, &part(1)).await.unwrap();
        assert_eq!(destination.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(destination.saved.lock().await[&1], part(1).data);
    }

    #[tokio::test]
    async fn test_second_failure_is_fatal() {
        let destination = Arc::new(FlakyDestination::default());
        destination.failures.lock().await.insert(0, 2);
        let uploader = PartUploader::new(destination.clone());

        let err = uploader.upload("s", 1, &part(0)).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::UploadPartFailure {
                index: 0,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(destination.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_waits_for_every_part() {
        let destination = Arc::new(FlakyDestination::default());
        destination.failures.lock().await.insert(2, 5);
        let uploader = PartUploader::new(destination.clone());

        let batch: Vec<Part> = (0..4).map(part).collect();
        let err = uploader.upload_batch("s", 4, &batch).await.unwrap_err();
        assert!(matches!(err, RelayError::UploadPartFailure { index: 2, .. }));

        let saved = destination.saved.lock().await;
        assert_eq!(saved.len(), 3);
        assert!(!saved.contains_key(&2));
    }
}
