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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use prost::Message;
use tempfile::TempDir;

use flashmpp::exec::chunk::{decode_chunk, Chunk, ChunkCodec};
use flashmpp::exec::plan::{
    DispatchRequest, EncodeType, ExchangeSender, Executor, PartitionType, PlanFragment, Region,
    RegionEpoch, TaskMeta,
};
use flashmpp::exec::source::{ChunkStream, ExecContext, PlanSource};
use flashmpp::{flashmpp_config, flashmpp_logging};

/// Install a test config (small flush threshold, fast monitor default)
/// and quiet logging, once per test binary.
pub fn init() {
    static SETUP: OnceLock<TempDir> = OnceLock::new();
    let dir = SETUP.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flashmpp.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        file.write_all(
            br#"
log_level = "warn"

[runtime]
records_per_chunk = 4
task_monitor_interval_ms = 50
"#,
        )
        .expect("write config");
        let _ = flashmpp_config::init_from_path(&path);
        dir
    });
    let _ = dir;
    flashmpp_logging::init();
}

pub fn test_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Utf8, true),
    ]))
}

pub fn chunk_of(keys: &[i64]) -> Chunk {
    let values: Vec<Option<String>> = keys.iter().map(|k| Some(format!("v{k}"))).collect();
    let batch = RecordBatch::try_new(
        test_schema(),
        vec![
            Arc::new(Int64Array::from(keys.to_vec())),
            Arc::new(StringArray::from(values)),
        ],
    )
    .expect("batch");
    Chunk::new(batch)
}

/// Keys of the `k` column inside one encoded tunnel payload.
pub fn decoded_keys(payload: &[u8]) -> Vec<i64> {
    let chunk = decode_chunk(ChunkCodec::Columnar, &test_schema(), payload).expect("decode chunk");
    let keys = chunk.columns()[0]
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column");
    (0..keys.len()).map(|i| keys.value(i)).collect()
}

/// Scripted behaviors for the stub pipeline.
#[derive(Clone)]
pub enum StubBehavior {
    /// Emit these chunks, then clean end-of-stream.
    Emit(Vec<Vec<i64>>),
    /// Pause before each chunk; stops early when aborted.
    SlowEmit { chunks: Vec<Vec<i64>>, pause: Duration },
    /// Produce nothing and block until aborted.
    Idle,
    /// Fail the first pull after `delay`.
    Fail { msg: String, delay: Duration },
}

pub struct StubPlanSource {
    behavior: StubBehavior,
}

impl StubPlanSource {
    pub fn new(behavior: StubBehavior) -> Arc<dyn PlanSource> {
        Arc::new(Self { behavior })
    }
}

impl PlanSource for StubPlanSource {
    fn build(
        &self,
        _plan: &PlanFragment,
        _regions: &[Region],
        ctx: &Arc<ExecContext>,
    ) -> Result<Box<dyn ChunkStream>, String> {
        Ok(Box::new(StubStream {
            behavior: self.behavior.clone(),
            ctx: Arc::clone(ctx),
            pos: 0,
        }))
    }
}

struct StubStream {
    behavior: StubBehavior,
    ctx: Arc<ExecContext>,
    pos: usize,
}

impl StubStream {
    fn emit(&mut self, chunks: &[Vec<i64>]) -> Result<Option<Chunk>, String> {
        if self.pos >= chunks.len() {
            return Ok(None);
        }
        let chunk = chunk_of(&chunks[self.pos]);
        self.pos += 1;
        self.ctx.on_rows_produced(chunk.len() as u64);
        Ok(Some(chunk))
    }
}

impl ChunkStream for StubStream {
    fn schema(&self) -> SchemaRef {
        test_schema()
    }

    fn next(&mut self) -> Result<Option<Chunk>, String> {
        match self.behavior.clone() {
            StubBehavior::Emit(chunks) => {
                if self.ctx.is_aborted() {
                    return Ok(None);
                }
                self.emit(&chunks)
            }
            StubBehavior::SlowEmit { chunks, pause } => {
                let deadline = Instant::now() + pause;
                while Instant::now() < deadline {
                    if self.ctx.is_aborted() {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                self.emit(&chunks)
            }
            StubBehavior::Idle => loop {
                if self.ctx.is_aborted() {
                    return Err("query stream is aborted".to_string());
                }
                std::thread::sleep(Duration::from_millis(5));
            },
            StubBehavior::Fail { msg, delay } => {
                std::thread::sleep(delay);
                Err(msg)
            }
        }
    }
}

pub fn task_meta(start_ts: i64, task_id: i64) -> TaskMeta {
    TaskMeta {
        start_ts,
        task_id,
        address: format!("127.0.0.1:39{task_id:02}"),
    }
}

/// A dispatch request whose plan root is an exchange sender toward the
/// given destination task ordinals.
pub fn dispatch_request(
    start_ts: i64,
    task_id: i64,
    partition: PartitionType,
    dest_ordinals: &[i64],
    partition_keys: &[i64],
    timeout: i64,
) -> DispatchRequest {
    let encoded_task_meta: Vec<Vec<u8>> = dest_ordinals
        .iter()
        .map(|&d| task_meta(start_ts, d).encode_to_vec())
        .collect();
    let plan = PlanFragment {
        root_executor: Some(Executor {
            exchange_sender: Some(ExchangeSender {
                tp: partition as i32,
                encoded_task_meta,
                partition_key_indices: partition_keys.to_vec(),
                encode_type: EncodeType::Columnar as i32,
            }),
            body: Vec::new(),
        }),
    };
    DispatchRequest {
        meta: Some(task_meta(start_ts, task_id)),
        encoded_plan: plan.encode_to_vec(),
        regions: Vec::new(),
        schema_ver: 1,
        timeout,
    }
}

pub fn region(id: u64) -> Region {
    Region {
        region_id: id,
        epoch: Some(RegionEpoch {
            version: 1,
            conf_ver: 1,
        }),
        ranges: Vec::new(),
    }
}

/// Poll `cond` until it holds or `deadline` elapses.
pub fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
