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

//! Resumable chunked relay engine.
//!
//! Streams an object from an HTTP source into a destination that accepts
//! part-indexed uploads followed by a compose call. Work is split into
//! bounded execution windows: when a window closes, the session cursor is
//! checkpointed and a continuation is dispatched to finish the job in a new
//! invocation.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use relay::{
//!     ContinuationRequest, HttpBigObjectClient, MemoryCheckpointStore, QueueDispatcher,
//!     RelayConfig, SessionRunner, TaskQueue,
//! };
//!
//! let config = RelayConfig::default();
//! let client = config.http_client()?;
//! let (queue, _receiver) = TaskQueue::new();
//! let runner = SessionRunner::builder()
//!     .config(config)
//!     .store(Arc::new(MemoryCheckpointStore::new()))
//!     .destination(Arc::new(HttpBigObjectClient::new(client, "https://dest", "token")?))
//!     .dispatcher(Arc::new(QueueDispatcher::new(queue)))
//!     .build()?;
//!
//! let outcome = runner
//!     .run(
//!         ContinuationRequest::builder()
//!             .source_key("https://example.com/video.mp4")
//!             .notify_target("chat-42")
//!             .build(),
//!     )
//!     .await?;
//! ```

mod assembler;
mod checkpoint;
mod config;
mod continuation;
mod deadline;
mod destination;
mod error;
mod file_store;
mod finalizer;
pub mod metrics;
mod notify;
mod progress;
mod queue;
mod reaper;
mod runner;
mod source;
mod types;
mod uploader;

pub use assembler::{ChunkAssembler, PartStream};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use config::RelayConfig;
pub use continuation::{ContinuationDispatcher, ContinuationTrigger, HttpContinuationDispatcher};
pub use deadline::{Clock, ExecutionWindow, ManualClock, SystemClock};
pub use destination::{BigObjectClient, ComposeAttributes, HttpBigObjectClient};
pub use error::RelayError;
pub use file_store::FileCheckpointStore;
pub use finalizer::{FinalizeOutcome, Finalizer, MediaKind};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use progress::ProgressReporter;
pub use queue::{InvocationHandler, QueueDispatcher, QueueWorker, TaskQueue, TaskReceiver};
pub use reaper::{Reaper, ReaperPolicy, SweepReport};
pub use runner::SessionRunner;
pub use source::{ByteStream, SourceMetadata, SourceReader};
pub use types::{
    ContinuationRequest, Part, RunOutcome, SessionStatus, TransferSession, part_len, total_parts,
};
pub use uploader::PartUploader;
