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
    env,
    io::IsTerminal,
    sync::{Arc, Mutex, Once},
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Layer, Registry, filter, layer::SubscriberExt};

/// Prefix of rotated log files; the error-only stream appends `-err`.
pub const LOG_FILE_PREFIX: &str = "relayer";

/// Handle for changing the level filter after initialization.
///
/// Only populated once `init_global_logging` has run.
pub static RELOAD_HANDLE: OnceCell<tracing_subscriber::reload::Handle<filter::Targets, Registry>> =
    OnceCell::new();

/// Configuration options for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for hourly rotated log files. Empty means stdout only.
    #[default = ""]
    #[builder(default, into)]
    pub dir: String,

    /// Level filter such as `"info"` or `"info,relay=debug"`. Falls back to
    /// `RUST_LOG`, then `"info"`.
    #[builder(into)]
    pub level: Option<String>,

    /// Output format for stdout and files.
    #[builder(default)]
    pub log_format: LogFormat,

    /// Maximum number of rotated files kept per stream (default 720, thirty
    /// days of hourly files).
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Whether to also write to stdout when file logging is enabled.
    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

/// Available log output formats.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with the current span and span list.
    Json,

    /// Human-readable text.
    #[default]
    Text,
}

/// Initialize logging for unit and integration tests.
///
/// Safe to call from every test; only the first call installs the
/// subscriber. `UNITTEST_LOG_DIR` and `UNITTEST_LOG_LEVEL` override the
/// defaults.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let mut g = GLOBAL_UT_LOG_GUARD
            .as_ref()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());

        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| {
            "debug,hyper=warn,hyper_util=warn,tower=warn,reqwest=warn,h2=info,axum=info"
                .to_string()
        });
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };
        *g = Some(init_global_logging("unittest", &opts));

        tracing::info!("logs dir = {}", dir);
    });
}

static GLOBAL_UT_LOG_GUARD: Lazy<Arc<Mutex<Option<Vec<WorkerGuard>>>>> =
    Lazy::new(|| Arc::new(Mutex::new(None)));

const DEFAULT_LOG_TARGETS: &str = "info";

type FilteredRegistry = tracing_subscriber::layer::Layered<
    tracing_subscriber::reload::Layer<filter::Targets, Registry>,
    Registry,
>;

type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Install the global subscriber.
///
/// Layers, depending on `opts`:
///
/// - stdout (when `append_stdout` is set)
/// - `relayer.*` hourly rolling files (when `dir` is set)
/// - `relayer-err.*` hourly rolling files holding only `ERROR` events
///
/// Runs once per process; later calls return no guards. Panics when the log
/// directory cannot be created or the level string does not parse, so a
/// misconfigured deployment fails at startup.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        LogTracer::init().expect("log tracer must be valid");

        let mut layers: Vec<BoxedLayer> = Vec::new();

        if opts.append_stdout || opts.dir.is_empty() {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);
            layers.push(fmt_layer(opts.log_format, writer, std::io::stdout().is_terminal()));
        }

        if !opts.dir.is_empty() {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling_appender(opts, LOG_FILE_PREFIX));
            guards.push(guard);
            layers.push(fmt_layer(opts.log_format, writer, false));

            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(
                opts,
                &format!("{LOG_FILE_PREFIX}-err"),
            ));
            guards.push(guard);
            layers.push(
                fmt_layer(opts.log_format, writer, false)
                    .with_filter(filter::LevelFilter::ERROR)
                    .boxed(),
            );
        }

        let filter = opts
            .level
            .as_deref()
            .or(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse::<filter::Targets>()
            .expect("error parsing log level string");

        let (dyn_filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);

        RELOAD_HANDLE
            .set(reload_handle)
            .expect("reload handle already set, maybe init_global_logging get called twice?");

        let subscriber = Registry::default().with(dyn_filter).with(layers);

        tracing::subscriber::set_global_default(subscriber)
            .expect("error setting global tracing subscriber");

        tracing::debug!(app = app_name, format = %opts.log_format, "logging initialized");
    });

    guards
}

fn rolling_appender(opts: &LoggingOptions, prefix: &str) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .unwrap_or_else(|e| {
            panic!(
                "initializing rolling file appender at {} failed: {}",
                &opts.dir, e
            )
        })
}

fn fmt_layer(
    format: LogFormat,
    writer: tracing_appender::non_blocking::NonBlocking,
    ansi: bool,
) -> BoxedLayer {
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}
