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

//! Wire model of dispatched plan fragments.
//!
//! Hand-written prost messages; the dispatcher only decodes the envelope
//! it needs (the exchange sender at the fragment root), the rest of the
//! plan tree stays opaque and is handed to the `PlanSource` untouched.

use prost::Message;

use crate::common::ids::TaskId;
use crate::exec::chunk::ChunkCodec;

/// Identity and location of one task, as carried on the wire. Also used
/// as the encoded destination metadata inside an exchange sender.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskMeta {
    #[prost(int64, tag = "1")]
    pub start_ts: i64,
    #[prost(int64, tag = "2")]
    pub task_id: i64,
    #[prost(string, tag = "3")]
    pub address: String,
}

impl TaskMeta {
    pub fn task(&self) -> TaskId {
        TaskId::new(self.start_ts, self.task_id)
    }
}

/// Row routing policy of an exchange sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum PartitionType {
    PassThrough = 0,
    Broadcast = 1,
    Hash = 2,
}

/// Payload encoding negotiated through the plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum EncodeType {
    Columnar = 0,
    Compact = 1,
    RowWise = 2,
}

impl EncodeType {
    pub fn codec(self) -> ChunkCodec {
        match self {
            EncodeType::Columnar => ChunkCodec::Columnar,
            EncodeType::Compact => ChunkCodec::Compact,
            EncodeType::RowWise => ChunkCodec::RowWise,
        }
    }
}

/// The plan node whose output is shipped through a TunnelSet.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExchangeSender {
    #[prost(enumeration = "PartitionType", tag = "1")]
    pub tp: i32,
    /// One encoded `TaskMeta` per downstream destination, in tunnel order.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub encoded_task_meta: Vec<Vec<u8>>,
    /// Column indices hashed for `PartitionType::Hash`.
    #[prost(int64, repeated, tag = "3")]
    pub partition_key_indices: Vec<i64>,
    #[prost(enumeration = "EncodeType", tag = "4")]
    pub encode_type: i32,
}

impl ExchangeSender {
    pub fn partition_type(&self) -> PartitionType {
        PartitionType::try_from(self.tp).unwrap_or(PartitionType::PassThrough)
    }
}

/// Root node of a dispatched fragment. Only the exchange sender is
/// interpreted by the runtime; `body` is the rest of the operator tree,
/// consumed by the `PlanSource`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Executor {
    #[prost(message, optional, tag = "1")]
    pub exchange_sender: Option<ExchangeSender>,
    #[prost(bytes = "vec", tag = "15")]
    pub body: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlanFragment {
    #[prost(message, optional, tag = "1")]
    pub root_executor: Option<Executor>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegionEpoch {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(uint64, tag = "2")]
    pub conf_ver: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyRange {
    #[prost(bytes = "vec", tag = "1")]
    pub start: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub end: Vec<u8>,
}

/// Storage shard touched by a fragment. Opaque to the runtime except for
/// duplicate detection; passed through to the `PlanSource`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Region {
    #[prost(uint64, tag = "1")]
    pub region_id: u64,
    #[prost(message, optional, tag = "2")]
    pub epoch: Option<RegionEpoch>,
    #[prost(message, repeated, tag = "3")]
    pub ranges: Vec<KeyRange>,
}

/// One dispatched fragment of a distributed query plan.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatchRequest {
    #[prost(message, optional, tag = "1")]
    pub meta: Option<TaskMeta>,
    #[prost(bytes = "vec", tag = "2")]
    pub encoded_plan: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub regions: Vec<Region>,
    #[prost(int64, tag = "4")]
    pub schema_ver: i64,
    /// Seconds. Negative selects test-mode timeouts, zero disables both
    /// the attach and running timeouts.
    #[prost(int64, tag = "5")]
    pub timeout: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatchError {
    #[prost(string, tag = "1")]
    pub msg: String,
}

/// `ok` means the fragment was accepted and launched, not that it
/// completed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatchResponse {
    #[prost(message, optional, tag = "1")]
    pub error: Option<DispatchError>,
}

impl DispatchResponse {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn from_error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(DispatchError { msg: msg.into() }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub fn decode_plan(bytes: &[u8]) -> Result<PlanFragment, String> {
    PlanFragment::decode(bytes).map_err(|e| format!("invalid encoded plan: {e}"))
}

pub fn decode_task_meta(bytes: &[u8]) -> Result<TaskMeta, String> {
    TaskMeta::decode(bytes).map_err(|e| format!("invalid encoded task meta: {e}"))
}
