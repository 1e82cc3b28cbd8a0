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

//! Service surface the transport calls into: fragment dispatch, receiver
//! attachment, and query cancellation.

use std::sync::Arc;
use std::time::Instant;

use crate::common::error::{MppError, MppResult};
use crate::common::ids::{QueryId, TaskId};
use crate::exec::source::PlanSource;
use crate::flashmpp_logging::{error, info};
use crate::runtime::task::MppTask;
use crate::runtime::task_manager::TaskManager;
use crate::runtime::tunnel::TunnelReceiver;

pub use crate::exec::plan::{DispatchError, DispatchRequest, DispatchResponse};

/// Handle one `DispatchRequest`: construct the task, prepare it
/// synchronously, then launch `run` on a worker thread.
///
/// An `ok` response means the fragment was accepted and launched, not
/// that it completed. The first captured fatal becomes the response
/// error.
pub fn handle_dispatch(
    manager: &Arc<TaskManager>,
    source: &Arc<dyn PlanSource>,
    request: &DispatchRequest,
) -> DispatchResponse {
    let started = Instant::now();
    let Some(meta) = request.meta.as_ref() else {
        return DispatchResponse::from_error("BadRequest: missing task meta");
    };
    let task = MppTask::new(meta, manager);
    match task.prepare(manager, source, request) {
        Ok(()) => {
            manager.spawn_run(Arc::clone(&task));
            info!(
                "processing dispatch of task {} is over; the time cost is {} ms",
                task.id(),
                started.elapsed().as_millis()
            );
            DispatchResponse::ok()
        }
        Err(e) => {
            let msg = e.to_string();
            error!("dispatch task {} meets error: {}", task.id(), msg);
            handle_error(manager, &task, &msg);
            DispatchResponse::from_error(msg)
        }
    }
}

/// Shared failure path for every prepare error: leave no half-registered
/// task and no orphan tunnel behind.
fn handle_error(manager: &Arc<TaskManager>, task: &Arc<MppTask>, msg: &str) {
    task.record_error(msg);
    task.close_all_tunnels(msg);
    manager.unregister_task(task);
}

/// Attach path used by the transport when a downstream peer connects to
/// the tunnel its producer registered.
pub fn establish_tunnel(
    manager: &Arc<TaskManager>,
    sender: TaskId,
    receiver: TaskId,
) -> MppResult<TunnelReceiver> {
    let task = manager
        .find_task(sender.query_id(), sender)
        .ok_or_else(|| MppError::BadRequest(format!("can't find task {sender}")))?;
    let tunnel = task.get_tunnel(&receiver)?;
    tunnel.attach()
}

/// Cancel RPC entry: cancels every task of the query on this node.
pub fn cancel_mpp_query(manager: &Arc<TaskManager>, query_id: QueryId, reason: &str) {
    manager.cancel_query(query_id, reason);
}
