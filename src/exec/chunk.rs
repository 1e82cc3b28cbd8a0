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
use std::io::Cursor;

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute;
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::CompressionType;
use arrow::json::writer::LineDelimitedWriter;
use arrow::json::ReaderBuilder;

/// A chunk of data, consisting of multiple rows. Wrapper around an Arrow
/// RecordBatch.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            batch: RecordBatch::new_empty(schema),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    /// Build a new chunk from the rows selected by `indices`, in order.
    pub fn take(&self, indices: &[u32]) -> Result<Self, String> {
        let indices = UInt32Array::from(indices.to_vec());
        let mut columns = Vec::with_capacity(self.batch.num_columns());
        for col in self.batch.columns() {
            let taken = compute::take(col.as_ref(), &indices, None)
                .map_err(|e| format!("Arrow take failed: {e}"))?;
            columns.push(taken);
        }
        let batch = RecordBatch::try_new(self.batch.schema(), columns)
            .map_err(|e| format!("failed to create RecordBatch: {e}"))?;
        Ok(Self { batch })
    }

    /// Concatenate chunks sharing `schema` into one chunk.
    pub fn concat(schema: &SchemaRef, chunks: &[Chunk]) -> Result<Self, String> {
        let batches: Vec<&RecordBatch> = chunks.iter().map(|c| &c.batch).collect();
        let batch = compute::concat_batches(schema, batches)
            .map_err(|e| format!("failed to concat chunks: {e}"))?;
        Ok(Self { batch })
    }
}

/// Payload encoding applied uniformly to all tunnels of one TunnelSet.
///
/// The IPC codecs embed their schema in the payload; `RowWise` relies on
/// the schema negotiated out of band through the plan.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkCodec {
    /// Arrow IPC stream format.
    Columnar,
    /// Arrow IPC stream format with ZSTD buffer compression.
    Compact,
    /// Line-delimited JSON rows.
    RowWise,
}

pub fn encode_chunk(codec: ChunkCodec, chunk: &Chunk) -> Result<Vec<u8>, String> {
    match codec {
        ChunkCodec::Columnar => encode_ipc(chunk, None),
        ChunkCodec::Compact => encode_ipc(chunk, Some(CompressionType::ZSTD)),
        ChunkCodec::RowWise => {
            let mut buffer = Vec::new();
            let mut writer = LineDelimitedWriter::new(&mut buffer);
            writer
                .write(&chunk.batch)
                .map_err(|e| format!("failed to write JSON rows: {e}"))?;
            writer
                .finish()
                .map_err(|e| format!("failed to finish JSON writer: {e}"))?;
            Ok(buffer)
        }
    }
}

fn encode_ipc(chunk: &Chunk, compression: Option<CompressionType>) -> Result<Vec<u8>, String> {
    let options = IpcWriteOptions::default()
        .try_with_compression(compression)
        .map_err(|e| format!("unsupported IPC compression: {e}"))?;
    let mut buffer = Vec::new();
    let mut writer =
        StreamWriter::try_new_with_options(&mut buffer, chunk.schema().as_ref(), options)
            .map_err(|e| format!("failed to create Arrow IPC writer: {e}"))?;
    writer
        .write(&chunk.batch)
        .map_err(|e| format!("failed to write batch: {e}"))?;
    writer
        .finish()
        .map_err(|e| format!("failed to finish Arrow IPC writer: {e}"))?;
    Ok(buffer)
}

pub fn decode_chunk(codec: ChunkCodec, schema: &SchemaRef, bytes: &[u8]) -> Result<Chunk, String> {
    if bytes.is_empty() {
        return Ok(Chunk::empty(schema.clone()));
    }
    let batches = match codec {
        ChunkCodec::Columnar | ChunkCodec::Compact => {
            let mut cursor = Cursor::new(bytes);
            let reader = StreamReader::try_new(&mut cursor, None)
                .map_err(|e| format!("failed to create Arrow IPC reader: {e}"))?;
            let mut batches = Vec::new();
            for batch in reader {
                batches.push(batch.map_err(|e| format!("failed to read batch: {e}"))?);
            }
            batches
        }
        ChunkCodec::RowWise => {
            let mut reader = ReaderBuilder::new(schema.clone())
                .build(Cursor::new(bytes))
                .map_err(|e| format!("failed to create JSON reader: {e}"))?;
            let mut batches = Vec::new();
            while let Some(batch) = reader.next() {
                batches.push(batch.map_err(|e| format!("failed to read JSON rows: {e}"))?);
            }
            batches
        }
    };
    if batches.is_empty() {
        return Ok(Chunk::empty(schema.clone()));
    }
    let chunks: Vec<Chunk> = batches.into_iter().map(Chunk::new).collect();
    Chunk::concat(schema, &chunks)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    use super::{decode_chunk, encode_chunk, Chunk, ChunkCodec};

    fn sample_chunk() -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, true),
        ]));
        let batch = arrow::array::RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])),
            ],
        )
        .expect("batch");
        Chunk::new(batch)
    }

    #[test]
    fn take_selects_rows_in_order() {
        let chunk = sample_chunk();
        let taken = chunk.take(&[2, 0]).expect("take");
        assert_eq!(taken.len(), 2);
        let keys = taken.columns()[0]
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        assert_eq!(keys.value(0), 3);
        assert_eq!(keys.value(1), 1);
    }

    #[test]
    fn codecs_round_trip_one_chunk() {
        let chunk = sample_chunk();
        for codec in [ChunkCodec::Columnar, ChunkCodec::Compact, ChunkCodec::RowWise] {
            let payload = encode_chunk(codec, &chunk).expect("encode");
            let decoded = decode_chunk(codec, &chunk.schema(), &payload).expect("decode");
            assert_eq!(decoded.batch, chunk.batch, "codec {codec:?}");
        }
    }

    #[test]
    fn decode_empty_payload_yields_empty_chunk() {
        let chunk = sample_chunk();
        let decoded = decode_chunk(ChunkCodec::RowWise, &chunk.schema(), b"").expect("decode");
        assert!(decoded.is_empty());
    }
}
