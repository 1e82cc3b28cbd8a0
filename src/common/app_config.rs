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
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

static CONFIG: OnceLock<FlashMppConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static FlashMppConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = FlashMppConfig::load_from_file(path.as_ref())?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static FlashMppConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = FlashMppConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("FLASHMPP_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidate = PathBuf::from("flashmpp.toml");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow!(
        "missing config file: set $FLASHMPP_CONFIG or create ./flashmpp.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct FlashMppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression. Takes precedence over
    /// `log_level` when set.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Row threshold at which a TunnelSet flushes one encoded chunk.
    #[serde(default = "default_records_per_chunk")]
    pub records_per_chunk: usize,

    /// Depth of a tunnel's bounded payload queue; the unit of pushback.
    #[serde(default = "default_tunnel_buffer_chunks")]
    pub tunnel_buffer_chunks: usize,

    /// Tick interval of the hang monitor.
    #[serde(default = "default_task_monitor_interval_ms")]
    pub task_monitor_interval_ms: u64,

    /// Hang threshold while a task has produced no rows yet.
    #[serde(default = "default_task_waiting_timeout_s")]
    pub task_waiting_timeout_s: u64,

    /// Worker threads draining dispatched task pipelines.
    #[serde(default = "default_task_worker_threads")]
    pub task_worker_threads: usize,
}

fn default_records_per_chunk() -> usize {
    1024
}

fn default_tunnel_buffer_chunks() -> usize {
    8
}

fn default_task_monitor_interval_ms() -> u64 {
    1000
}

fn default_task_waiting_timeout_s() -> u64 {
    3600
}

fn default_task_worker_threads() -> usize {
    8
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            records_per_chunk: default_records_per_chunk(),
            tunnel_buffer_chunks: default_tunnel_buffer_chunks(),
            task_monitor_interval_ms: default_task_monitor_interval_ms(),
            task_waiting_timeout_s: default_task_waiting_timeout_s(),
            task_worker_threads: default_task_worker_threads(),
        }
    }
}

impl FlashMppConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let cfg: FlashMppConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::FlashMppConfig;

    #[test]
    fn parse_minimal_config() {
        let cfg: FlashMppConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.runtime.records_per_chunk, 1024);
        assert_eq!(cfg.runtime.tunnel_buffer_chunks, 8);
    }

    #[test]
    fn parse_runtime_overrides() {
        let cfg: FlashMppConfig = toml::from_str(
            r#"
log_level = "debug"

[runtime]
records_per_chunk = 256
task_monitor_interval_ms = 100
"#,
        )
        .expect("config parses");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.runtime.records_per_chunk, 256);
        assert_eq!(cfg.runtime.task_monitor_interval_ms, 100);
        assert_eq!(cfg.runtime.task_waiting_timeout_s, 3600);
    }
}
