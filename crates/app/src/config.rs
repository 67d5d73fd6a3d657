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

use std::path::{Path, PathBuf};

use bon::Builder;
use relay::{RelayConfig, ReaperPolicy};
use relayer_common_telemetry::LoggingOptions;
use relayer_server::http::RestServerConfig;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("Failed to read config file {}", path.display()))]
    Read {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse config file {}", path.display()))]
    Parse {
        path:   PathBuf,
        source: toml::de::Error,
    },
}

/// Where composed objects go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Base URL of the big-object upload API
    pub base_url: String,
    /// Bearer token for the upload API
    pub token:    String,
}

/// How suspended sessions are handed to the next invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    /// Invocation endpoint to POST continuations to. Unset means the
    /// in-process queue of this service.
    pub endpoint: Option<String>,
    /// Bearer token sent with, and required on, invocations
    pub token:    Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for file checkpoints. Unset keeps checkpoints in memory.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving status messages. Unset logs them instead.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    #[default = true]
    pub enabled: bool,
    pub policy:  ReaperPolicy,
}

/// Configuration for the application
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct AppConfig {
    /// REST server configuration
    #[builder(default)]
    pub http:                     RestServerConfig,
    #[builder(default)]
    pub relay:                    RelayConfig,
    #[builder(default)]
    pub logging:                  LoggingOptions,
    #[builder(default)]
    pub destination:              DestinationConfig,
    #[builder(default)]
    pub continuation:             ContinuationConfig,
    #[builder(default)]
    pub checkpoint:               CheckpointConfig,
    #[builder(default)]
    pub notify:                   NotifyConfig,
    #[builder(default)]
    pub reaper:                   ReaperConfig,
    /// Whether to stop on Ctrl-C and SIGTERM
    #[default = true]
    #[builder(default = true)]
    pub enable_graceful_shutdown: bool,
}

impl AppConfig {
    /// Load a TOML config file. Missing sections take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        toml::from_str(&content).context(ParseSnafu { path })
    }
}
