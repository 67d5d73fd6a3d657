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

use std::sync::LazyLock;

use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, register_histogram_vec, register_int_counter,
    register_int_counter_vec,
};

pub const RESULT_LABEL: &str = "result";
pub const OUTCOME_LABEL: &str = "outcome";
pub const ACTION_LABEL: &str = "action";

pub static PARTS_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("relay_parts_uploaded_total", "Total number of parts uploaded").unwrap()
});

pub static PART_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "relay_part_retries_total",
        "Total number of part uploads retried after a failed attempt"
    )
    .unwrap()
});

pub static BYTES_RELAYED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "relay_bytes_total",
        "Total number of bytes uploaded to the destination"
    )
    .unwrap()
});

pub static CONTINUATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "relay_continuations_total",
        "Total number of continuation dispatches by result",
        &[RESULT_LABEL]
    )
    .unwrap()
});

pub static SESSIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "relay_invocations_total",
        "Total number of relay invocations by outcome",
        &[OUTCOME_LABEL]
    )
    .unwrap()
});

pub static REAPED_SESSIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "relay_reaped_sessions_total",
        "Total number of stalled sessions handled by the reaper",
        &[ACTION_LABEL]
    )
    .unwrap()
});

pub static INVOCATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "relay_invocation_duration_seconds",
        "Wall-clock duration of one relay invocation",
        &[OUTCOME_LABEL]
    )
    .unwrap()
});
