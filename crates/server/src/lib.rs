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

pub mod error;
pub mod http;
pub mod invocation;

use snafu::{ResultExt, Snafu};
use tokio::{sync::oneshot::Receiver, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(transparent)]
    Network { source: NetworkError },

    #[snafu(display("Server task exited before it started"))]
    StartAborted {
        source: tokio::sync::oneshot::error::RecvError,
    },
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum NetworkError {
    #[snafu(display("Failed to bind {addr}"))]
    BindError {
        addr:   String,
        #[snafu(source)]
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse address {addr}"))]
    ParseAddressError {
        addr:   String,
        #[snafu(source)]
        source: std::net::AddrParseError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle for managing a running service.
///
/// Provides a way to wait until the server accepts connections, signal a
/// graceful shutdown and wait for the server task to finish.
pub struct ServiceHandler {
    /// Join handle for the server task
    join_handle:        JoinHandle<()>,
    /// Token for signalling shutdown
    cancellation_token: CancellationToken,
    /// Receiver for server start notification
    started_rx:         Option<Receiver<()>>,
    /// Address the listener is bound to
    local_addr:         std::net::SocketAddr,
}

impl ServiceHandler {
    /// Waits for the server to start accepting connections.
    ///
    /// Returns immediately if the start signal was already consumed.
    pub async fn wait_for_start(&mut self) -> Result<()> {
        if let Some(started_rx) = self.started_rx.take() {
            started_rx.await.context(StartAbortedSnafu)?;
        }
        Ok(())
    }

    /// Waits for the server task to finish. Call `shutdown()` first.
    pub async fn wait_for_stop(self) {
        if let Err(err) = self.join_handle.await {
            tracing::error!(error = %err, "server task panicked");
        }
    }

    /// Signals the server to begin graceful shutdown.
    pub fn shutdown(&self) { self.cancellation_token.cancel(); }

    /// Checks if the server task has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.join_handle.is_finished() }

    /// The bound address; useful when the configured port was 0.
    #[must_use]
    pub const fn local_addr(&self) -> std::net::SocketAddr { self.local_addr }
}
