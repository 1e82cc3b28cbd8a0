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
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float32Array, Float64Array, PrimitiveArray,
    StringArray};
use arrow::datatypes::{
    DataType, Date32Type, Int16Type, Int32Type, Int64Type, Int8Type, SchemaRef, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};

use crate::common::error::{MppError, MppResult};
use crate::exec::chunk::{encode_chunk, Chunk, ChunkCodec};
use crate::exec::plan::PartitionType;
use crate::runtime::tunnel::Tunnel;

const FNV_SEED: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// The ordered bundle of one producer task's outgoing tunnels.
#[derive(Default)]
pub struct TunnelSet {
    tunnels: Vec<Arc<Tunnel>>,
}

impl TunnelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tunnel: Arc<Tunnel>) {
        self.tunnels.push(tunnel);
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn tunnels(&self) -> &[Arc<Tunnel>] {
        &self.tunnels
    }

    /// Signal clean end-of-stream on every tunnel. The first failure is
    /// returned after all tunnels have been signalled.
    pub fn write_end_to_all(&self) -> MppResult<()> {
        let mut first_err = None;
        for tunnel in &self.tunnels {
            if let Err(e) = tunnel.write_end() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn write_error_to_all(&self, msg: &str) {
        for tunnel in &self.tunnels {
            tunnel.write_error(msg);
        }
    }

    pub fn close_all(&self, reason: &str) {
        for tunnel in &self.tunnels {
            tunnel.close(reason);
        }
    }
}

/// Streams pipeline output into a TunnelSet: routes rows according to the
/// partition policy, accumulates them per destination, and flushes one
/// encoded chunk payload whenever a destination reaches the row threshold
/// or the input ends.
pub struct TunnelSetWriter {
    set: TunnelSet,
    partition: PartitionType,
    partition_cols: Vec<usize>,
    codec: ChunkCodec,
    records_per_chunk: usize,
    schema: SchemaRef,
    pending: Vec<Vec<Chunk>>,
    pending_rows: Vec<usize>,
}

impl TunnelSetWriter {
    pub fn new(
        set: TunnelSet,
        partition: PartitionType,
        partition_cols: Vec<usize>,
        codec: ChunkCodec,
        records_per_chunk: usize,
        schema: SchemaRef,
    ) -> Self {
        // Broadcast accumulates once and fans the encoded payload out.
        let slots = match partition {
            PartitionType::Broadcast => 1,
            _ => set.len(),
        };
        Self {
            set,
            partition,
            partition_cols,
            codec,
            records_per_chunk: records_per_chunk.max(1),
            schema,
            pending: vec![Vec::new(); slots],
            pending_rows: vec![0; slots],
        }
    }

    pub fn tunnel_set(&self) -> &TunnelSet {
        &self.set
    }

    pub fn write(&mut self, chunk: Chunk) -> MppResult<()> {
        if self.set.is_empty() || chunk.is_empty() {
            // A root fragment has no outgoing tunnels; its output returns
            // to the coordinator through a different surface.
            return Ok(());
        }
        match self.partition {
            PartitionType::Broadcast | PartitionType::PassThrough => self.buffer_rows(0, chunk),
            PartitionType::Hash => {
                let buckets =
                    hash_partition_chunk(&chunk, &self.partition_cols, self.set.len())
                        .map_err(MppError::Pipeline)?;
                for (slot, part) in buckets.into_iter().enumerate() {
                    if let Some(part) = part {
                        self.buffer_rows(slot, part)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Flush every destination's accumulated rows. Called once at clean
    /// end of input, before the End terminals.
    pub fn finish(&mut self) -> MppResult<()> {
        for slot in 0..self.pending.len() {
            self.flush_slot(slot)?;
        }
        Ok(())
    }

    fn buffer_rows(&mut self, slot: usize, chunk: Chunk) -> MppResult<()> {
        self.pending_rows[slot] += chunk.len();
        self.pending[slot].push(chunk);
        if self.pending_rows[slot] >= self.records_per_chunk {
            self.flush_slot(slot)
        } else {
            Ok(())
        }
    }

    fn flush_slot(&mut self, slot: usize) -> MppResult<()> {
        if self.pending[slot].is_empty() {
            return Ok(());
        }
        let chunks = std::mem::take(&mut self.pending[slot]);
        self.pending_rows[slot] = 0;
        let merged = Chunk::concat(&self.schema, &chunks).map_err(MppError::Pipeline)?;
        let payload = encode_chunk(self.codec, &merged).map_err(MppError::Pipeline)?;
        match self.partition {
            PartitionType::Broadcast => {
                for tunnel in self.set.tunnels() {
                    tunnel.write(payload.clone())?;
                }
                Ok(())
            }
            _ => self.set.tunnels()[slot].write(payload),
        }
    }
}

/// Split one chunk into `n` row buckets by FNV hash of the partition
/// columns. Empty buckets come back as `None`.
pub fn hash_partition_chunk(
    chunk: &Chunk,
    partition_cols: &[usize],
    n: usize,
) -> Result<Vec<Option<Chunk>>, String> {
    if partition_cols.is_empty() {
        return Err("hash partition without partition columns".to_string());
    }
    let hashes = hash_rows(chunk, partition_cols)?;
    let mut indices: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (row, hash) in hashes.iter().enumerate() {
        indices[*hash as usize % n].push(row as u32);
    }
    let mut buckets = Vec::with_capacity(n);
    for rows in indices {
        if rows.is_empty() {
            buckets.push(None);
        } else {
            buckets.push(Some(chunk.take(&rows)?));
        }
    }
    Ok(buckets)
}

/// Per-row FNV-1a hash combined across the partition columns, nulls
/// folded in by the prime multiply alone.
fn hash_rows(chunk: &Chunk, partition_cols: &[usize]) -> Result<Vec<u32>, String> {
    let mut hashes = vec![FNV_SEED; chunk.len()];
    for &col in partition_cols {
        let array = chunk.columns().get(col).ok_or_else(|| {
            format!(
                "hash partition column {} out of range ({} columns)",
                col,
                chunk.columns().len()
            )
        })?;
        mix_column(array, &mut hashes)?;
    }
    Ok(hashes)
}

fn fnv_hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash = FNV_SEED;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[inline]
fn mix(hash: &mut u32, value: Option<&[u8]>) {
    if let Some(bytes) = value {
        *hash ^= fnv_hash_bytes(bytes);
    }
    *hash = hash.wrapping_mul(FNV_PRIME);
}

fn mix_column(array: &ArrayRef, hashes: &mut [u32]) -> Result<(), String> {
    macro_rules! mix_primitive {
        ($arrow_ty:ty) => {{
            let arr = array
                .as_any()
                .downcast_ref::<PrimitiveArray<$arrow_ty>>()
                .ok_or_else(|| format!("failed to downcast {:?} column", array.data_type()))?;
            for (i, hash) in hashes.iter_mut().enumerate() {
                if arr.is_null(i) {
                    mix(hash, None);
                } else {
                    mix(hash, Some(&arr.value(i).to_le_bytes()));
                }
            }
        }};
    }

    match array.data_type() {
        DataType::Boolean => {
            let arr = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| "failed to downcast to BooleanArray".to_string())?;
            for (i, hash) in hashes.iter_mut().enumerate() {
                if arr.is_null(i) {
                    mix(hash, None);
                } else {
                    mix(hash, Some(&[arr.value(i) as u8]));
                }
            }
        }
        DataType::Int8 => mix_primitive!(Int8Type),
        DataType::Int16 => mix_primitive!(Int16Type),
        DataType::Int32 => mix_primitive!(Int32Type),
        DataType::Int64 => mix_primitive!(Int64Type),
        DataType::UInt8 => mix_primitive!(UInt8Type),
        DataType::UInt16 => mix_primitive!(UInt16Type),
        DataType::UInt32 => mix_primitive!(UInt32Type),
        DataType::UInt64 => mix_primitive!(UInt64Type),
        DataType::Date32 => mix_primitive!(Date32Type),
        DataType::Float32 => {
            let arr = array
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| "failed to downcast to Float32Array".to_string())?;
            for (i, hash) in hashes.iter_mut().enumerate() {
                if arr.is_null(i) {
                    mix(hash, None);
                } else {
                    mix(hash, Some(&arr.value(i).to_bits().to_le_bytes()));
                }
            }
        }
        DataType::Float64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| "failed to downcast to Float64Array".to_string())?;
            for (i, hash) in hashes.iter_mut().enumerate() {
                if arr.is_null(i) {
                    mix(hash, None);
                } else {
                    mix(hash, Some(&arr.value(i).to_bits().to_le_bytes()));
                }
            }
        }
        DataType::Utf8 => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| "failed to downcast to StringArray".to_string())?;
            for (i, hash) in hashes.iter_mut().enumerate() {
                if arr.is_null(i) {
                    mix(hash, None);
                } else {
                    mix(hash, Some(arr.value(i).as_bytes()));
                }
            }
        }
        other => {
            return Err(format!(
                "hash partition: unsupported array type for FNV hash: {other:?}"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    use super::{hash_partition_chunk, hash_rows};
    use crate::exec::chunk::Chunk;

    fn keyed_chunk(keys: &[i64]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, true),
        ]));
        let values: Vec<Option<String>> = keys.iter().map(|k| Some(format!("v{k}"))).collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(keys.to_vec())),
                Arc::new(StringArray::from(values)),
            ],
        )
        .expect("batch");
        Chunk::new(batch)
    }

    #[test]
    fn hash_is_deterministic_per_key() {
        let chunk = keyed_chunk(&[7, 7, 8]);
        let hashes = hash_rows(&chunk, &[0]).expect("hash");
        assert_eq!(hashes[0], hashes[1]);
        assert_ne!(hashes[0], hashes[2]);
    }

    #[test]
    fn hash_partition_covers_every_row_once() {
        let chunk = keyed_chunk(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let buckets = hash_partition_chunk(&chunk, &[0], 3).expect("partition");
        let total: usize = buckets.iter().flatten().map(|c| c.len()).sum();
        assert_eq!(total, chunk.len());
    }

    #[test]
    fn same_key_lands_in_same_bucket() {
        let chunk = keyed_chunk(&[5, 5, 5, 9]);
        let buckets = hash_partition_chunk(&chunk, &[0], 2).expect("partition");
        let with_fives: Vec<usize> = buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                let b = b.as_ref()?;
                let keys = b.columns()[0]
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .expect("int64");
                (0..keys.len()).any(|r| keys.value(r) == 5).then_some(i)
            })
            .collect();
        assert_eq!(with_fives.len(), 1, "key 5 must map to one bucket");
    }

    #[test]
    fn unsupported_partition_column_type_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "b",
            DataType::Binary,
            false,
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(arrow::array::BinaryArray::from(
                vec![&b"x"[..], &b"y"[..]],
            ))],
        )
        .expect("batch");
        let err = hash_rows(&Chunk::new(batch), &[0]).expect_err("must fail");
        assert!(err.contains("unsupported"), "{err}");
    }
}
