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

//! Seams between the task runtime and the physical execution engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::plan::{PlanFragment, Region};

/// Per-query execution state handed to the `PlanSource`.
///
/// Carries the session settings the plan compiler needs, the progress
/// counter the pipeline bumps for every produced row, and the cooperative
/// abort flag the input stream observes on cancellation.
pub struct ExecContext {
    pub read_tso: i64,
    pub schema_version: i64,
    pub records_per_chunk: usize,
    progress: Arc<AtomicU64>,
    aborted: Arc<AtomicBool>,
}

impl ExecContext {
    pub(crate) fn new(
        read_tso: i64,
        schema_version: i64,
        records_per_chunk: usize,
        progress: Arc<AtomicU64>,
    ) -> Self {
        Self {
            read_tso,
            schema_version,
            records_per_chunk,
            progress,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Progress hook: the pipeline calls this for every batch of rows it
    /// produces. The hang monitor watches the counter behind it.
    pub fn on_rows_produced(&self, rows: u64) {
        self.progress.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// Output of one fragment pipeline, pulled chunk by chunk.
///
/// `next` returns `Ok(None)` at clean end-of-stream. A stream that
/// observes `ExecContext::is_aborted` should stop producing; returning
/// either `Ok(None)` or an error after that point is acceptable.
pub trait ChunkStream: Send {
    fn schema(&self) -> SchemaRef;

    fn next(&mut self) -> Result<Option<Chunk>, String>;
}

/// Builds the local pipeline for a dispatched fragment.
///
/// Building is synchronous and may block for seconds on data-dependent
/// preparation.
pub trait PlanSource: Send + Sync {
    fn build(
        &self,
        plan: &PlanFragment,
        regions: &[Region],
        ctx: &Arc<ExecContext>,
    ) -> Result<Box<dyn ChunkStream>, String>;
}
