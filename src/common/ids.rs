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
use std::fmt;

/// Start timestamp assigned by the coordinator. Every task of one logical
/// query shares it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub i64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query:{}", self.0)
    }
}

/// Identifier of one MPP task: the query start timestamp plus the task
/// ordinal the coordinator assigned within that query.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskId {
    pub start_ts: i64,
    pub task_id: i64,
}

impl TaskId {
    pub fn new(start_ts: i64, task_id: i64) -> Self {
        Self { start_ts, task_id }
    }

    pub fn query_id(&self) -> QueryId {
        QueryId(self.start_ts)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start_ts, self.task_id)
    }
}

/// Identifier of a point-to-point tunnel between two tasks of one query.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TunnelId {
    pub sender: TaskId,
    pub receiver: TaskId,
}

impl TunnelId {
    pub fn new(sender: TaskId, receiver: TaskId) -> Self {
        Self { sender, receiver }
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel{}+{}", self.sender.task_id, self.receiver.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{QueryId, TaskId, TunnelId};

    #[test]
    fn task_id_display_matches_log_format() {
        let id = TaskId::new(433_434, 7);
        assert_eq!(id.to_string(), "[433434,7]");
        assert_eq!(id.query_id(), QueryId(433_434));
    }

    #[test]
    fn tunnel_id_display_uses_task_ordinals() {
        let id = TunnelId::new(TaskId::new(1, 2), TaskId::new(1, 5));
        assert_eq!(id.to_string(), "tunnel2+5");
    }

    #[test]
    fn task_id_equality_is_structural() {
        assert_eq!(TaskId::new(10, 1), TaskId::new(10, 1));
        assert_ne!(TaskId::new(10, 1), TaskId::new(11, 1));
    }
}
