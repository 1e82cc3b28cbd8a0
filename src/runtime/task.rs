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

//! Lifecycle of one MPP fragment: prepare, run, cancel, hang detection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::common::config;
use crate::common::error::{MppError, MppResult};
use crate::common::ids::{TaskId, TunnelId};
use crate::exec::plan::{decode_plan, decode_task_meta, DispatchRequest, PartitionType, TaskMeta};
use crate::exec::source::{ChunkStream, ExecContext, PlanSource};
use crate::flashmpp_logging::{debug, error, info, warn};
use crate::runtime::mem_tracker::{process_mem_tracker, MemTracker};
use crate::runtime::task_manager::TaskManager;
use crate::runtime::tunnel::Tunnel;
use crate::runtime::tunnel_set::{TunnelSet, TunnelSetWriter};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TaskStatus {
    Initializing = 0,
    Running = 1,
    Finished = 2,
    Cancelled = 3,
}

impl TaskStatus {
    fn from_u8(v: u8) -> TaskStatus {
        match v {
            0 => TaskStatus::Initializing,
            1 => TaskStatus::Running,
            2 => TaskStatus::Finished,
            _ => TaskStatus::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Initializing => "initializing",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row counter bumped by the pipeline plus the no-progress clock the hang
/// monitor maintains across its ticks.
pub struct TaskProgress {
    current: Arc<AtomicU64>,
    progress_on_last_check: AtomicU64,
    no_progress_since: Mutex<Option<Instant>>,
}

impl TaskProgress {
    fn new() -> Self {
        Self {
            current: Arc::new(AtomicU64::new(0)),
            progress_on_last_check: AtomicU64::new(0),
            no_progress_since: Mutex::new(None),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current)
    }

    /// Only the hang monitor calls this; the clock state is keyed to its
    /// sampling. The clock starts on the first observation of a stalled
    /// value and resets whenever progress advances.
    fn is_hanging(
        &self,
        waiting_timeout: Option<Duration>,
        running_timeout: Option<Duration>,
    ) -> bool {
        let current = self.current.load(Ordering::Acquire);
        let last = self.progress_on_last_check.swap(current, Ordering::AcqRel);
        let mut stalled = self.no_progress_since.lock().expect("task progress lock");
        if current != last {
            *stalled = None;
            return false;
        }
        match *stalled {
            None => {
                *stalled = Some(Instant::now());
                false
            }
            Some(since) => {
                let threshold = if current == 0 {
                    waiting_timeout
                } else {
                    running_timeout
                };
                match threshold {
                    Some(t) => since.elapsed() > t,
                    None => false,
                }
            }
        }
    }
}

/// Timeouts seeded from the dispatch request's `timeout` field.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct TaskTimeouts {
    pub attach: Option<Duration>,
    pub waiting: Option<Duration>,
    pub running: Option<Duration>,
}

impl TaskTimeouts {
    fn from_request(timeout: i64, waiting: Option<Duration>) -> Self {
        if timeout < 0 {
            // Test mode.
            Self {
                attach: Some(Duration::from_secs(5)),
                waiting,
                running: Some(Duration::from_secs(10)),
            }
        } else if timeout == 0 {
            Self {
                attach: None,
                waiting,
                running: None,
            }
        } else {
            // The attach deadline doubles as the tunnel write timeout, so
            // the producer is reported hanging strictly after it.
            Self {
                attach: Some(Duration::from_secs(timeout as u64)),
                waiting,
                running: Some(Duration::from_secs(timeout as u64 + 30)),
            }
        }
    }
}

struct TaskPipeline {
    stream: Box<dyn ChunkStream>,
    writer: TunnelSetWriter,
}

/// One fragment of a distributed query running on this node.
pub struct MppTask {
    id: TaskId,
    status: AtomicU8,
    progress: TaskProgress,
    timeouts: OnceLock<TaskTimeouts>,
    exec_ctx: OnceLock<Arc<ExecContext>>,
    /// Outgoing tunnels this task owns as producer, keyed by receiver.
    tunnels: Mutex<HashMap<TaskId, Arc<Tunnel>>>,
    pipeline: Mutex<Option<TaskPipeline>>,
    /// First captured fatal; later errors are logged only.
    err_slot: Mutex<Option<String>>,
    manager: Weak<TaskManager>,
    mem_tracker: Arc<MemTracker>,
    compile_time_ns: AtomicI64,
}

impl MppTask {
    pub fn new(meta: &TaskMeta, manager: &Arc<TaskManager>) -> Arc<Self> {
        let id = meta.task();
        Arc::new(Self {
            id,
            status: AtomicU8::new(TaskStatus::Initializing as u8),
            progress: TaskProgress::new(),
            timeouts: OnceLock::new(),
            exec_ctx: OnceLock::new(),
            tunnels: Mutex::new(HashMap::new()),
            pipeline: Mutex::new(None),
            err_slot: Mutex::new(None),
            manager: Arc::downgrade(manager),
            mem_tracker: MemTracker::new_child(format!("task_{id}"), &process_mem_tracker()),
            compile_time_ns: AtomicI64::new(0),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn progress_rows(&self) -> u64 {
        self.progress.current()
    }

    pub fn compile_time_ns(&self) -> i64 {
        self.compile_time_ns.load(Ordering::Relaxed)
    }

    pub fn peak_memory_bytes(&self) -> i64 {
        self.mem_tracker.peak()
    }

    pub fn captured_error(&self) -> Option<String> {
        self.err_slot.lock().expect("task error slot lock").clone()
    }

    /// First write wins.
    pub(crate) fn record_error(&self, msg: &str) -> bool {
        let mut slot = self.err_slot.lock().expect("task error slot lock");
        if slot.is_none() {
            *slot = Some(msg.to_string());
            true
        } else {
            false
        }
    }

    /// Decode the request, register this task and its tunnels, and build
    /// the execution pipeline. Synchronous; plan compilation and
    /// data-dependent preparation may take a long time.
    ///
    /// Any failure after registration must be followed by the dispatch
    /// error path (close tunnels, unregister) on the caller's side.
    pub fn prepare(
        self: &Arc<Self>,
        manager: &Arc<TaskManager>,
        source: &Arc<dyn PlanSource>,
        request: &DispatchRequest,
    ) -> MppResult<()> {
        let started = Instant::now();

        let plan = decode_plan(&request.encoded_plan).map_err(MppError::BadRequest)?;
        let mut seen_regions = HashSet::with_capacity(request.regions.len());
        for region in &request.regions {
            if !seen_regions.insert(region.region_id) {
                return Err(MppError::BadRequest(format!(
                    "contain duplicate region {}",
                    region.region_id
                )));
            }
        }

        let timeouts = TaskTimeouts::from_request(request.timeout, manager.waiting_timeout());
        let _ = self.timeouts.set(timeouts);

        let ctx = Arc::new(ExecContext::new(
            self.id.start_ts,
            request.schema_ver,
            config::records_per_chunk(),
            self.progress.counter(),
        ));
        let _ = self.exec_ctx.set(Arc::clone(&ctx));

        debug!("begin to register the task {}", self.id);
        if !manager.register_task(self) {
            return Err(MppError::DuplicateTask(self.id));
        }

        let sender = plan
            .root_executor
            .as_ref()
            .and_then(|e| e.exchange_sender.as_ref())
            .ok_or_else(|| {
                MppError::BadRequest("fragment root executor is not an exchange sender".to_string())
            })?;
        let partition = sender.partition_type();
        if partition == PartitionType::PassThrough && sender.encoded_task_meta.len() > 1 {
            return Err(MppError::BadRequest(
                "pass-through exchange expects at most one destination".to_string(),
            ));
        }

        let mut set = TunnelSet::new();
        for encoded in &sender.encoded_task_meta {
            let peer = decode_task_meta(encoded).map_err(MppError::BadRequest)?;
            let tunnel = Arc::new(Tunnel::new(
                TunnelId::new(self.id, peer.task()),
                timeouts.attach,
                config::tunnel_buffer_chunks(),
                Some(Arc::clone(&self.mem_tracker)),
            ));
            tunnel.set_task(self);
            debug!("begin to register the tunnel {}", tunnel.id());
            self.register_tunnel(peer.task(), Arc::clone(&tunnel))?;
            set.push(tunnel);
        }

        // Build the pipeline; this may take a long time.
        let stream = source
            .build(&plan, &request.regions, &ctx)
            .map_err(MppError::BadRequest)?;
        let schema = stream.schema();
        let partition_cols: Vec<usize> = sender
            .partition_key_indices
            .iter()
            .map(|&i| i as usize)
            .collect();
        let writer = TunnelSetWriter::new(
            set,
            partition,
            partition_cols,
            sender.encode_type().codec(),
            ctx.records_per_chunk,
            schema,
        );
        *self.pipeline.lock().expect("task pipeline lock") = Some(TaskPipeline { stream, writer });

        self.compile_time_ns
            .store(started.elapsed().as_nanos() as i64, Ordering::Relaxed);
        debug!(
            "task {} prepared in {} ms",
            self.id,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    fn register_tunnel(&self, receiver: TaskId, tunnel: Arc<Tunnel>) -> MppResult<()> {
        let mut tunnels = self.tunnels.lock().expect("task tunnels lock");
        if tunnels.insert(receiver, tunnel).is_some() {
            return Err(MppError::BadRequest(format!(
                "duplicate tunnel destination {receiver}"
            )));
        }
        Ok(())
    }

    /// Drive the pipeline to completion. Runs on one worker thread.
    pub fn run(self: &Arc<Self>) {
        if self
            .status
            .compare_exchange(
                TaskStatus::Initializing as u8,
                TaskStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!("task {} in {} state, skip running", self.id, self.status());
            return;
        }
        info!("task {} starts running", self.id);
        let started = Instant::now();

        let pipeline = self.pipeline.lock().expect("task pipeline lock").take();
        let fatal = match pipeline {
            Some(pipeline) => self.drive_pipeline(pipeline),
            None => Some("task pipeline is not prepared".to_string()),
        };

        if let Some(msg) = fatal {
            if self.record_error(&msg) {
                error!("task {} running meets error: {}", self.id, msg);
                self.write_error_to_all_tunnels(&msg);
            } else {
                debug!("task {} follow-up error not re-broadcast: {}", self.id, msg);
            }
        }

        let _ = self.status.compare_exchange(
            TaskStatus::Running as u8,
            TaskStatus::Finished as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(
            "task {} ends in {} state, time cost {} ms, peak memory {} bytes",
            self.id,
            self.status(),
            started.elapsed().as_millis(),
            self.mem_tracker.peak()
        );
        self.unregister();
    }

    fn drive_pipeline(&self, mut pipeline: TaskPipeline) -> Option<String> {
        let mut rows = 0u64;
        loop {
            match pipeline.stream.next() {
                Ok(Some(chunk)) => {
                    rows += chunk.len() as u64;
                    if let Err(e) = pipeline.writer.write(chunk) {
                        return Some(e.to_string());
                    }
                }
                Ok(None) => {
                    if let Err(e) = pipeline.writer.finish() {
                        return Some(e.to_string());
                    }
                    if let Err(e) = pipeline.writer.tunnel_set().write_end_to_all() {
                        return Some(e.to_string());
                    }
                    debug!("task {} finish write with {} rows", self.id, rows);
                    return None;
                }
                Err(e) => return Some(MppError::Pipeline(e).to_string()),
            }
        }
    }

    /// Query-level cancellation. Idempotent, returns without waiting for
    /// `run` to exit; the pipeline observes the input stream abort or the
    /// closed tunnels.
    pub fn cancel(&self, reason: &str) {
        loop {
            let current = self.status.load(Ordering::Acquire);
            if current == TaskStatus::Finished as u8 || current == TaskStatus::Cancelled as u8 {
                return;
            }
            if self
                .status
                .compare_exchange(
                    current,
                    TaskStatus::Cancelled as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        warn!("begin cancel task: {}", self.id);
        self.record_error(reason);
        if let Some(ctx) = self.exec_ctx.get() {
            ctx.abort();
        }
        // Query-level cancel: there is no guarantee any tunnel ever got
        // connected, so force-close rather than write-error.
        self.close_all_tunnels(reason);
        warn!("finish cancel task: {}", self.id);
    }

    pub(crate) fn close_all_tunnels(&self, reason: &str) {
        let tunnels: Vec<Arc<Tunnel>> = self
            .tunnels
            .lock()
            .expect("task tunnels lock")
            .values()
            .cloned()
            .collect();
        for tunnel in tunnels {
            tunnel.close(reason);
        }
    }

    fn write_error_to_all_tunnels(&self, msg: &str) {
        let tunnels: Vec<Arc<Tunnel>> = self
            .tunnels
            .lock()
            .expect("task tunnels lock")
            .values()
            .cloned()
            .collect();
        for tunnel in tunnels {
            tunnel.write_error(msg);
        }
    }

    /// Receiver-side attach failure reported through the tunnel's task
    /// back-reference.
    pub(crate) fn on_tunnel_attach_timeout(&self, id: TunnelId, msg: &str) {
        warn!("task {} tunnel {} attach timed out", self.id, id);
        self.record_error(msg);
    }

    /// Look up the outgoing tunnel toward `receiver` for an incoming
    /// transport connection.
    pub fn get_tunnel(&self, receiver: &TaskId) -> MppResult<Arc<Tunnel>> {
        if self.status() == TaskStatus::Cancelled {
            let reason = self
                .captured_error()
                .unwrap_or_else(|| "task is cancelled".to_string());
            return Err(MppError::Cancelled(reason));
        }
        self.tunnels
            .lock()
            .expect("task tunnels lock")
            .get(receiver)
            .cloned()
            .ok_or_else(|| MppError::BadRequest(format!("can't find tunnel to task {receiver}")))
    }

    /// True only while Running with a progress counter that has stalled
    /// past the applicable timeout.
    pub fn is_hanging(&self) -> bool {
        if self.status() != TaskStatus::Running {
            return false;
        }
        let timeouts = self.timeouts.get().copied().unwrap_or_default();
        self.progress.is_hanging(timeouts.waiting, timeouts.running)
    }

    fn unregister(self: &Arc<Self>) {
        match self.manager.upgrade() {
            Some(manager) => {
                manager.unregister_task(self);
                debug!("task {} unregistered", self.id);
            }
            None => error!("task manager is unset"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::{TaskProgress, TaskTimeouts};

    #[test]
    fn request_timeout_seeds_task_timeouts() {
        let waiting = Some(Duration::from_secs(60));

        let test_mode = TaskTimeouts::from_request(-1, waiting);
        assert_eq!(test_mode.attach, Some(Duration::from_secs(5)));
        assert_eq!(test_mode.running, Some(Duration::from_secs(10)));

        let disabled = TaskTimeouts::from_request(0, waiting);
        assert_eq!(disabled.attach, None);
        assert_eq!(disabled.running, None);

        let seeded = TaskTimeouts::from_request(7, waiting);
        assert_eq!(seeded.attach, Some(Duration::from_secs(7)));
        assert_eq!(seeded.running, Some(Duration::from_secs(37)));
        assert_eq!(seeded.waiting, waiting);
    }

    #[test]
    fn advancing_progress_is_never_hanging() {
        let progress = TaskProgress::new();
        let tiny = Some(Duration::from_millis(1));
        for i in 1..5u64 {
            progress.current.store(i, Ordering::Release);
            std::thread::sleep(Duration::from_millis(5));
            assert!(!progress.is_hanging(tiny, tiny));
        }
    }

    #[test]
    fn stalled_progress_hangs_after_threshold() {
        let progress = TaskProgress::new();
        let waiting = Some(Duration::from_millis(20));
        // First check arms the no-progress clock.
        assert!(!progress.is_hanging(waiting, None));
        std::thread::sleep(Duration::from_millis(40));
        assert!(progress.is_hanging(waiting, None));
    }

    #[test]
    fn running_threshold_applies_after_first_row() {
        let progress = TaskProgress::new();
        let waiting = Some(Duration::from_millis(1));
        let running = None;
        progress.current.store(10, Ordering::Release);
        assert!(!progress.is_hanging(waiting, running));
        std::thread::sleep(Duration::from_millis(20));
        // Stalled with rows produced: the (disabled) running timeout rules.
        assert!(!progress.is_hanging(waiting, running));
    }

    #[test]
    fn progress_reset_restarts_the_clock() {
        let progress = TaskProgress::new();
        let waiting = Some(Duration::from_millis(20));
        assert!(!progress.is_hanging(waiting, waiting));
        std::thread::sleep(Duration::from_millis(40));
        progress.current.store(1, Ordering::Release);
        // Advanced since the last check: not hanging, clock cleared.
        assert!(!progress.is_hanging(waiting, waiting));
    }
}
