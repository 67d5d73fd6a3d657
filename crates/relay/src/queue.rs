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

//! In-process task queue for invocations.
//!
//! Delivery is at-least-once. While a request for a given
//! `(source_key, session_id, next_part_index)` is waiting to run, identical
//! requests are dropped. The key is released as soon as the request starts,
//! so a running invocation can always hand off to its own cursor.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{continuation::ContinuationDispatcher, error::RelayError, types::ContinuationRequest};

type TaskKey = (String, Option<String>, u64);

fn task_key(request: &ContinuationRequest) -> TaskKey {
    (
        request.source_key.clone(),
        request.session_id.clone(),
        request.next_part_index,
    )
}

/// Executes one dequeued invocation.
#[async_trait]
pub trait InvocationHandler: Send + Sync + 'static {
    async fn handle(&self, request: ContinuationRequest);
}

/// Producer side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    sender:  mpsc::UnboundedSender<ContinuationRequest>,
    pending: Arc<Mutex<HashSet<TaskKey>>>,
}

/// Consumer side of the queue, driven by [`QueueWorker`].
pub struct TaskReceiver {
    receiver: mpsc::UnboundedReceiver<ContinuationRequest>,
    pending:  Arc<Mutex<HashSet<TaskKey>>>,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> (Self, TaskReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        (
            Self {
                sender,
                pending: pending.clone(),
            },
            TaskReceiver { receiver, pending },
        )
    }

    /// Enqueue `request`. Returns `false` when an identical request is
    /// already pending.
    pub fn enqueue(&self, request: ContinuationRequest) -> Result<bool, RelayError> {
        let key = task_key(&request);
        {
            let mut pending = self.pending.lock().map_err(|_| RelayError::QueueClosed)?;
            if !pending.insert(key.clone()) {
                debug!(
                    source_key = %key.0,
                    session_id = ?key.1,
                    next_part_index = key.2,
                    "duplicate invocation dropped"
                );
                return Ok(false);
            }
        }

        if self.sender.send(request).is_err() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&key);
            }
            return Err(RelayError::QueueClosed);
        }
        Ok(true)
    }

    /// Number of requests waiting to run.
    #[must_use]
    pub fn len(&self) -> usize { self.pending.lock().map_or(0, |pending| pending.len()) }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl TaskReceiver {
    fn release(&self, request: &ContinuationRequest) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&task_key(request));
        }
    }
}

/// [`ContinuationDispatcher`] that feeds the in-process queue.
pub struct QueueDispatcher {
    queue: TaskQueue,
}

impl QueueDispatcher {
    #[must_use]
    pub const fn new(queue: TaskQueue) -> Self { Self { queue } }
}

#[async_trait]
impl ContinuationDispatcher for QueueDispatcher {
    async fn dispatch(&self, request: &ContinuationRequest) -> Result<(), RelayError> {
        // An identical request is waiting to run, which is as good as accepted.
        self.queue.enqueue(request.clone()).map(drop)
    }
}

/// Pulls requests off the queue and runs each in its own task.
pub struct QueueWorker<H> {
    receiver: TaskReceiver,
    handler:  Arc<H>,
}

impl<H: InvocationHandler> QueueWorker<H> {
    pub const fn new(receiver: TaskReceiver, handler: Arc<H>) -> Self { Self { receiver, handler } }

    /// Run until `cancel` fires, then wait for running invocations.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut running = JoinSet::new();
        info!("Relay queue worker started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                request = self.receiver.receiver.recv() => {
                    let Some(request) = request else { break };
                    self.receiver.release(&request);
                    let handler = self.handler.clone();
                    running.spawn(async move { handler.handle(request).await });
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "relay invocation task failed");
                    }
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "relay invocation task failed");
            }
        }
        info!("Relay queue worker stopped");
    }
}
