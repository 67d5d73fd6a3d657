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

//! Panic reporting for the relay service.
//!
//! Invocations run on spawned tasks; a panic there only shows up as a failed
//! join unless it is logged where it happens.

use std::{panic, sync::LazyLock, thread};

use backtrace::Backtrace;
use prometheus::{IntCounterVec, register_int_counter_vec};

/// Panics observed by the hook, labelled by the panicking thread's name.
pub static PANICS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("relayer_panics_total", "Total number of panics", &["thread"])
        .unwrap()
});

/// Log panics as `ERROR` events tagged with `service` and the thread name,
/// count them, then chain to the previous hook.
pub fn set_panic_hook(service: &'static str) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let current = thread::current();
        let thread_name = current.name().unwrap_or("unnamed");
        let backtrace = format!("{:?}", Backtrace::new());
        match info.location() {
            Some(location) => tracing::error!(
                service,
                thread = thread_name,
                message = %info,
                backtrace = %backtrace,
                panic.file = location.file(),
                panic.line = location.line(),
                "panicked"
            ),
            None => tracing::error!(
                service,
                thread = thread_name,
                message = %info,
                backtrace = %backtrace,
                "panicked"
            ),
        }
        PANICS.with_label_values(&[thread_name]).inc();
        previous(info);
    }));
}
