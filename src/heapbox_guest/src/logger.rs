/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::io::Write;
use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record, set_logger, set_max_level};

static LOGGER: StderrLogger = StderrLogger {};
static INIT: Once = Once::new();

/// Writes log records to the inherited stderr. The child's environment is
/// cleared, so the level is fixed by the caller.
pub struct StderrLogger {}

impl StderrLogger {
    /// Installs the logger once for the process.
    pub fn initialize(level: LevelFilter) {
        INIT.call_once(|| {
            if set_logger(&LOGGER).is_ok() {
                set_max_level(level);
            }
        });
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let _ = writeln!(
            std::io::stderr().lock(),
            "[heapbox child {}] {} {}: {}",
            std::process::id(),
            tag,
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
