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

use clap::{Args, Parser, Subcommand};
use relay::ContinuationRequest;
use relayer_app::AppConfig;
use snafu::{ResultExt, Whatever, whatever};

#[derive(Debug, Parser)]
#[clap(
name = "relayer",
about = "Resumable chunked relay service",
author = env!("CARGO_PKG_AUTHORS"),
version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve(ServeArgs),
    Invoke(InvokeArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Starts the relay service.
Examples:

relayer serve --config relayer.toml

")]
struct ServeArgs {
    /// TOML config file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ServeArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let config = match &self.config {
            Some(path) => AppConfig::load(path).whatever_context("Failed to load config")?,
            None => AppConfig::default(),
        };

        let _guards = relayer_common_telemetry::init_global_logging("relayer", &config.logging);
        relayer_common_telemetry::set_panic_hook("relayer");

        config.open().run().await
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Asks a running relay service to relay a source URL.
Examples:

relayer invoke https://example.com/video.mp4 --notify-target chat-42

")]
struct InvokeArgs {
    /// URL of the object to relay
    source: String,

    /// Where progress and the final report are sent
    #[arg(long)]
    notify_target: String,

    /// Base URL of the relay service
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Bearer token, if the service requires one
    #[arg(long, env = "RELAYER_TOKEN")]
    token: Option<String>,
}

impl InvokeArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let request = ContinuationRequest::builder()
            .source_key(self.source.clone())
            .notify_target(self.notify_target.clone())
            .build();
        let url = format!(
            "{}/api/v1/relay/invocations",
            self.server.trim_end_matches('/')
        );

        let mut builder = reqwest::Client::new().post(&url).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .with_whatever_context(|_| format!("Failed to reach {url}"))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .whatever_context("Invalid response body")?;
        if !status.is_success() {
            whatever!("Invocation rejected with HTTP {status}: {body}");
        }
        println!("{body}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Serve(args) => args.run().await,
        Commands::Invoke(args) => args.run().await,
    }
}
