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
use crate::common::ids::{TaskId, TunnelId};

/// Fatal error kinds raised by the MPP task runtime.
///
/// The message of every variant starts with the kind name so the string
/// form carried through tunnel `Error` terminals and dispatch responses
/// stays classifiable on the far side of the wire.
#[derive(thiserror::Error, Clone, Debug)]
pub enum MppError {
    #[error("BadRequest: {0}")]
    BadRequest(String),

    #[error("DuplicateTask: task {0} has already been registered")]
    DuplicateTask(TaskId),

    #[error("AttachTimeout: {0} waited too long for the receiver to connect")]
    AttachTimeout(TunnelId),

    #[error("AlreadyAttached: {0} has been connected by another receiver")]
    AlreadyAttached(TunnelId),

    #[error("TunnelClosed: {id} can no longer be written: {reason}")]
    TunnelClosed { id: TunnelId, reason: String },

    #[error("PipelineFatal: {0}")]
    Pipeline(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

pub type MppResult<T> = Result<T, MppError>;
