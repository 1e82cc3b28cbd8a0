// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fmt;
use std::sync::OnceLock;

use chrono::Local;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Compact local timestamp (`yyyymmdd hh:mm:ss.uuuuuu`) for log lines.
struct CompactLocalTime;

impl FormatTime for CompactLocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", Local::now().format("%Y%m%d %H:%M:%S%.6f"))
    }
}

pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        // ANSI escapes turn into garbage when stderr is redirected to a file.
        let use_ansi = atty::is(atty::Stream::Stderr);
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_env_filter(EnvFilter::new(level))
            .with_writer(std::io::stderr)
            .with_ansi(use_ansi)
            .with_timer(CompactLocalTime)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .try_init();
    });
}

pub fn init() {
    let level = crate::flashmpp_config::config()
        .ok()
        .map(|c| c.log_filter.clone().unwrap_or_else(|| c.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    init_with_level(&level);
}

pub use tracing::{debug, error, info, warn};
