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

//! Process-wide task registry, query-level cancellation, and the
//! background hang monitor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use threadpool::ThreadPool;

use crate::common::config;
use crate::common::ids::{QueryId, TaskId};
use crate::flashmpp_logging::{debug, error, info, warn};
use crate::runtime::task::MppTask;

pub const HANG_CANCEL_REASON: &str = "MPP Task canceled because it seems hangs";

#[derive(Clone, Debug)]
pub struct TaskManagerSettings {
    /// Hang threshold while a task has produced no rows yet; `None`
    /// disables it.
    pub waiting_timeout: Option<Duration>,
    pub monitor_interval: Duration,
    pub worker_threads: usize,
}

impl Default for TaskManagerSettings {
    fn default() -> Self {
        Self {
            waiting_timeout: Some(config::task_waiting_timeout()),
            monitor_interval: config::task_monitor_interval(),
            worker_threads: config::task_worker_threads(),
        }
    }
}

/// Canonical owner of every live task in this process.
///
/// Constructed once by the host server and injected into the transport
/// startup path; the monitor thread keeps a strong reference, so the host
/// must call `shutdown` when tearing the server down.
pub struct TaskManager {
    queries: Mutex<HashMap<QueryId, HashMap<TaskId, Arc<MppTask>>>>,
    settings: TaskManagerSettings,
    pool: ThreadPool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TaskManager {
    pub fn new(settings: TaskManagerSettings) -> Arc<Self> {
        let manager = Arc::new(Self {
            queries: Mutex::new(HashMap::new()),
            pool: ThreadPool::with_name(
                "mpp task worker".to_string(),
                settings.worker_threads.max(1),
            ),
            settings,
            monitor: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        let mgr = Arc::clone(&manager);
        let handle = thread::spawn(move || mgr.monitor_loop());
        *manager.monitor.lock().expect("monitor handle lock") = Some(handle);
        manager
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(TaskManagerSettings::default())
    }

    pub(crate) fn waiting_timeout(&self) -> Option<Duration> {
        self.settings.waiting_timeout
    }

    fn monitor_loop(self: Arc<Self>) {
        while !self.stopped.load(Ordering::Acquire) {
            // A failing tick must not take the monitor down with it.
            let tick = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.monitor_tick();
            }));
            if let Err(panic) = tick {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("task monitor tick failed: {}", msg);
            }
            thread::sleep(self.settings.monitor_interval);
        }
    }

    /// One sweep over a snapshot of the registry. Cancellation happens
    /// outside the registry lock.
    fn monitor_tick(&self) {
        for query_id in self.current_queries() {
            let tasks = self.current_tasks(query_id);
            if tasks.iter().any(|t| t.is_hanging()) {
                warn!("{} has a hanging task, cancelling the whole query", query_id);
                self.cancel_query(query_id, HANG_CANCEL_REASON);
            }
        }
    }

    /// Insert under `(query, task)`; false on collision.
    pub fn register_task(&self, task: &Arc<MppTask>) -> bool {
        let id = task.id();
        let mut queries = self.queries.lock().expect("task manager lock");
        let tasks = queries.entry(id.query_id()).or_default();
        if tasks.contains_key(&id) {
            return false;
        }
        tasks.insert(id, Arc::clone(task));
        debug!("task {} registered", id);
        true
    }

    /// Remove the task; the query entry is dropped once empty. Only the
    /// exact registered instance is removed, so the error path of a
    /// failed duplicate dispatch cannot evict the original.
    pub fn unregister_task(&self, task: &Arc<MppTask>) {
        let id = task.id();
        let mut queries = self.queries.lock().expect("task manager lock");
        if let Some(tasks) = queries.get_mut(&id.query_id()) {
            if tasks.get(&id).is_some_and(|t| Arc::ptr_eq(t, task)) {
                tasks.remove(&id);
                if tasks.is_empty() {
                    queries.remove(&id.query_id());
                }
            }
        }
    }

    pub fn find_task(&self, query_id: QueryId, task_id: TaskId) -> Option<Arc<MppTask>> {
        let queries = self.queries.lock().expect("task manager lock");
        queries
            .get(&query_id)
            .and_then(|tasks| tasks.get(&task_id).cloned())
    }

    pub fn current_queries(&self) -> Vec<QueryId> {
        self.queries
            .lock()
            .expect("task manager lock")
            .keys()
            .copied()
            .collect()
    }

    pub fn current_tasks(&self, query_id: QueryId) -> Vec<Arc<MppTask>> {
        self.queries
            .lock()
            .expect("task manager lock")
            .get(&query_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancel every task of one query. Tasks are snapshotted under the
    /// lock and cancelled after it is released; the query entry is then
    /// dropped, since a cancelled task that never ran has no other
    /// unregister path.
    pub fn cancel_query(&self, query_id: QueryId, reason: &str) {
        let tasks = self.current_tasks(query_id);
        if tasks.is_empty() {
            return;
        }
        warn!("begin cancel query: {}", query_id);
        for task in &tasks {
            task.cancel(reason);
        }
        self.queries
            .lock()
            .expect("task manager lock")
            .remove(&query_id);
        warn!("finish cancel query: {}", query_id);
    }

    pub(crate) fn spawn_run(&self, task: Arc<MppTask>) {
        self.pool.execute(move || task.run());
    }

    /// Stop the hang monitor and wait for in-flight task runs.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.monitor.lock().expect("monitor handle lock").take() {
            let _ = handle.join();
        }
        self.pool.join();
        info!("task manager stopped");
    }
}
