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

use std::time::Duration;

use jiff::SignedDuration;
use relayer_base::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::error::{ConfigSnafu, RelayError};

/// Configuration for the relay engine.
///
/// Passed explicitly to [`crate::SessionRunner`]; nothing is read from the
/// process environment.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Size of every part except the last (default: 512KiB)
    #[default(ReadableSize::kb(512))]
    pub part_size: ReadableSize,

    /// Wall-clock budget of one invocation, strictly below the host's hard
    /// kill limit (default: 25s)
    #[default(SignedDuration::from_secs(25))]
    pub execution_budget: SignedDuration,

    /// Reserved for dispatching the continuation (default: 2s)
    #[default(SignedDuration::from_secs(2))]
    pub dispatch_margin: SignedDuration,

    /// Reserved for letting an in-flight batch drain (default: 3s)
    #[default(SignedDuration::from_secs(3))]
    pub drain_margin: SignedDuration,

    /// Maximum number of parts uploaded concurrently in one batch
    #[default = 4]
    pub parallel_uploads: usize,

    /// Lifetime of a checkpoint that is never finalized (default: 24h)
    #[default(SignedDuration::from_hours(24))]
    pub checkpoint_ttl: SignedDuration,

    /// Largest body buffered in memory when the source reports no size
    /// (default: 20MiB)
    #[default(ReadableSize::mb(20))]
    pub buffer_ceiling: ReadableSize,

    /// Largest object relayed from a source without Range support, i.e. what
    /// one execution window can move (default: 50MiB)
    #[default(ReadableSize::mb(50))]
    pub single_window_limit: ReadableSize,

    /// Minimum time between two progress reports (default: 3s)
    #[default(SignedDuration::from_secs(3))]
    pub progress_interval: SignedDuration,

    /// Report progress at least every this many parts, regardless of time
    #[default = 16]
    pub progress_part_step: u64,

    /// Retries after the first continuation dispatch attempt
    #[default = 3]
    pub continuation_retries: usize,

    /// First backoff delay between continuation dispatch attempts
    #[default(SignedDuration::from_millis(200))]
    pub continuation_backoff: SignedDuration,

    /// A streaming checkpoint untouched for this long is considered stalled
    #[default(SignedDuration::from_mins(10))]
    pub stale_threshold: SignedDuration,

    /// How often the reaper scans the checkpoint store
    #[default(SignedDuration::from_secs(60))]
    pub reaper_interval: SignedDuration,

    /// Timeout for a single HTTP request
    #[default(SignedDuration::from_secs(30))]
    pub timeout: SignedDuration,

    /// Custom User-Agent header for source and destination requests
    pub user_agent: Option<String>,
}

impl RelayConfig {
    /// Reject configurations the engine cannot make progress with.
    pub fn validate(&self) -> Result<(), RelayError> {
        ensure!(
            self.part_size.as_bytes() > 0,
            ConfigSnafu {
                message: "part_size must be greater than zero",
            }
        );
        ensure!(
            self.parallel_uploads > 0,
            ConfigSnafu {
                message: "parallel_uploads must be at least 1",
            }
        );
        ensure!(
            self.dispatch_margin >= SignedDuration::ZERO && self.drain_margin >= SignedDuration::ZERO,
            ConfigSnafu {
                message: "dispatch_margin and drain_margin must not be negative",
            }
        );
        ensure!(
            self.working_budget() > SignedDuration::ZERO,
            ConfigSnafu {
                message: format!(
                    "execution_budget ({}) must exceed dispatch_margin + drain_margin ({})",
                    self.execution_budget,
                    self.dispatch_margin + self.drain_margin
                ),
            }
        );
        ensure!(
            self.timeout > SignedDuration::ZERO,
            ConfigSnafu {
                message: "timeout must be positive",
            }
        );
        Ok(())
    }

    /// Time an invocation may spend starting new batches.
    #[must_use]
    pub fn working_budget(&self) -> SignedDuration {
        self.execution_budget - self.dispatch_margin - self.drain_margin
    }

    /// `part_size` in bytes as `usize`.
    #[must_use]
    pub fn part_size_bytes(&self) -> usize { self.part_size.as_usize() }

    /// HTTP client shared by the source reader, destination and dispatchers.
    pub fn http_client(&self) -> Result<reqwest::Client, RelayError> {
        let mut builder = reqwest::Client::builder().timeout(to_std(self.timeout));
        if let Some(ref ua) = self.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        builder.build().map_err(|err| RelayError::Config {
            message: format!("failed to build HTTP client: {err}"),
        })
    }
}

/// Convert a configured duration, clamping negatives to zero.
pub(crate) fn to_std(duration: SignedDuration) -> Duration {
    Duration::try_from(duration).unwrap_or_default()
}
