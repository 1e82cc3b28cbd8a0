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
use std::time::Duration;

use crate::flashmpp_config::config as flashmpp_app_config;

pub(crate) fn records_per_chunk() -> usize {
    flashmpp_app_config()
        .ok()
        .map(|c| c.runtime.records_per_chunk)
        .unwrap_or(1024)
        .max(1)
}

pub(crate) fn tunnel_buffer_chunks() -> usize {
    flashmpp_app_config()
        .ok()
        .map(|c| c.runtime.tunnel_buffer_chunks)
        .unwrap_or(8)
        .max(1)
}

pub(crate) fn task_monitor_interval() -> Duration {
    let ms = flashmpp_app_config()
        .ok()
        .map(|c| c.runtime.task_monitor_interval_ms)
        .unwrap_or(1000)
        .max(1);
    Duration::from_millis(ms)
}

pub(crate) fn task_waiting_timeout() -> Duration {
    let secs = flashmpp_app_config()
        .ok()
        .map(|c| c.runtime.task_waiting_timeout_s)
        .unwrap_or(3600);
    Duration::from_secs(secs)
}

pub(crate) fn task_worker_threads() -> usize {
    flashmpp_app_config()
        .ok()
        .map(|c| c.runtime.task_worker_threads)
        .unwrap_or(8)
        .max(1)
}
