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
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::common::error::{MppError, MppResult};
use crate::common::ids::TunnelId;
use crate::flashmpp_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::task::MppTask;

const TUNNEL_WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TunnelState {
    Unconnected,
    Connected,
    Finished,
    Closed,
}

/// One message observed by the receiver side of a tunnel: zero or more
/// encoded chunk payloads followed by exactly one terminal.
#[derive(Clone, Debug, PartialEq)]
pub enum TunnelMessage {
    Chunk(Vec<u8>),
    End,
    Error(String),
}

struct TunnelInner {
    state: TunnelState,
    /// Chunk payloads in write order; the terminal, once written, is the
    /// last entry and never followed by anything.
    buffer: VecDeque<TunnelMessage>,
    writer_closed: bool,
    reader_attached: bool,
    terminal: Option<TunnelMessage>,
    terminal_delivered: bool,
}

impl TunnelInner {
    fn close_reason(&self) -> String {
        match self.terminal.as_ref() {
            Some(TunnelMessage::Error(msg)) => msg.clone(),
            Some(TunnelMessage::End) => "tunnel has been finished".to_string(),
            _ => "tunnel is closed".to_string(),
        }
    }
}

/// A single directed, ordered chunk channel from one producer task to one
/// consumer task.
///
/// The producer writes encoded chunk payloads and exactly one terminal
/// (`End` or `Error`); the attached receiver observes them in write
/// order. The payload queue is bounded and is the unit of pushback
/// toward the producer.
pub struct Tunnel {
    id: TunnelId,
    /// Maximum wait from registration to receiver attachment; `None`
    /// disables the attach deadline.
    timeout: Option<Duration>,
    capacity: usize,
    registered_at: Instant,
    inner: Mutex<TunnelInner>,
    cv: Condvar,
    /// Owning producer task; relation + lookup only. Used to report an
    /// attach timeout observed on the receiver side.
    task: Mutex<Weak<MppTask>>,
    mem_tracker: Option<Arc<MemTracker>>,
}

impl Tunnel {
    pub fn new(
        id: TunnelId,
        timeout: Option<Duration>,
        capacity: usize,
        mem_tracker: Option<Arc<MemTracker>>,
    ) -> Self {
        Self {
            id,
            timeout,
            capacity: capacity.max(1),
            registered_at: Instant::now(),
            inner: Mutex::new(TunnelInner {
                state: TunnelState::Unconnected,
                buffer: VecDeque::new(),
                writer_closed: false,
                reader_attached: false,
                terminal: None,
                terminal_delivered: false,
            }),
            cv: Condvar::new(),
            task: Mutex::new(Weak::new()),
            mem_tracker,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn state(&self) -> TunnelState {
        self.inner.lock().expect("tunnel lock").state
    }

    /// The terminal the receiver has observed or will observe, if one has
    /// been written.
    pub fn terminal_message(&self) -> Option<TunnelMessage> {
        self.inner.lock().expect("tunnel lock").terminal.clone()
    }

    pub(crate) fn set_task(&self, task: &Arc<MppTask>) {
        *self.task.lock().expect("tunnel task ref lock") = Arc::downgrade(task);
    }

    fn consume_mem(&self, bytes: usize) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.consume(bytes as i64);
        }
    }

    fn release_mem(&self, bytes: usize) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(bytes as i64);
        }
    }

    /// Append one encoded chunk payload. Suspends until the receiver has
    /// attached (failing after the attach deadline) and while the payload
    /// queue is full.
    pub fn write(&self, payload: Vec<u8>) -> MppResult<()> {
        let mut inner = self.inner.lock().expect("tunnel lock");
        loop {
            if inner.state == TunnelState::Closed {
                return Err(MppError::TunnelClosed {
                    id: self.id,
                    reason: inner.close_reason(),
                });
            }
            if inner.writer_closed {
                return Err(MppError::TunnelClosed {
                    id: self.id,
                    reason: inner.close_reason(),
                });
            }
            if inner.reader_attached {
                if inner.buffer.len() < self.capacity {
                    break;
                }
                // Backpressure: queue full, wait for the receiver to drain.
                let (next, _) = self
                    .cv
                    .wait_timeout(inner, TUNNEL_WAIT_LOG_INTERVAL)
                    .expect("tunnel wait");
                inner = next;
                continue;
            }
            inner = self.wait_attach_step(inner)?;
        }
        let bytes = payload.len();
        inner.buffer.push_back(TunnelMessage::Chunk(payload));
        self.consume_mem(bytes);
        self.cv.notify_all();
        Ok(())
    }

    /// One bounded wait while still unconnected; errors out past the
    /// attach deadline.
    fn wait_attach_step<'a>(
        &'a self,
        inner: std::sync::MutexGuard<'a, TunnelInner>,
    ) -> MppResult<std::sync::MutexGuard<'a, TunnelInner>> {
        let step = match self.timeout {
            Some(timeout) => {
                let elapsed = self.registered_at.elapsed();
                if elapsed >= timeout {
                    debug!(
                        "{} attach timed out after {:?}, producer gives up",
                        self.id, elapsed
                    );
                    return Err(MppError::AttachTimeout(self.id));
                }
                (timeout - elapsed).min(TUNNEL_WAIT_LOG_INTERVAL)
            }
            None => TUNNEL_WAIT_LOG_INTERVAL,
        };
        let (next, res) = self.cv.wait_timeout(inner, step).expect("tunnel wait");
        if res.timed_out() && !next.reader_attached && next.state == TunnelState::Unconnected {
            debug!(
                "{} still waiting for receiver, elapsed={:?}",
                self.id,
                self.registered_at.elapsed()
            );
        }
        Ok(next)
    }

    /// Producer-side rendezvous: returns once the receiver has attached.
    pub fn wait_for_attach(&self) -> MppResult<()> {
        let mut inner = self.inner.lock().expect("tunnel lock");
        loop {
            if inner.state == TunnelState::Closed {
                return Err(MppError::TunnelClosed {
                    id: self.id,
                    reason: inner.close_reason(),
                });
            }
            if inner.reader_attached {
                return Ok(());
            }
            inner = self.wait_attach_step(inner)?;
        }
    }

    /// Append the End terminal. Further writes fail.
    pub fn write_end(&self) -> MppResult<()> {
        let mut inner = self.inner.lock().expect("tunnel lock");
        if inner.state == TunnelState::Closed || inner.writer_closed {
            return Err(MppError::TunnelClosed {
                id: self.id,
                reason: inner.close_reason(),
            });
        }
        inner.buffer.push_back(TunnelMessage::End);
        inner.writer_closed = true;
        inner.terminal = Some(TunnelMessage::End);
        self.cv.notify_all();
        Ok(())
    }

    /// Append the Error terminal. Idempotent: once a terminal exists the
    /// call is discarded.
    pub fn write_error(&self, msg: &str) {
        let mut inner = self.inner.lock().expect("tunnel lock");
        if inner.state == TunnelState::Closed || inner.writer_closed {
            debug!("{} already terminated, error discarded: {}", self.id, msg);
            return;
        }
        inner
            .buffer
            .push_back(TunnelMessage::Error(msg.to_string()));
        inner.writer_closed = true;
        inner.terminal = Some(TunnelMessage::Error(msg.to_string()));
        self.cv.notify_all();
    }

    /// Unconditional shutdown: buffered chunks are dropped, an Error
    /// terminal is appended if none was produced, all waiters wake.
    pub fn close(&self, reason: &str) {
        let mut inner = self.inner.lock().expect("tunnel lock");
        if inner.state == TunnelState::Closed {
            return;
        }
        let mut dropped = 0usize;
        inner.buffer.retain(|msg| match msg {
            TunnelMessage::Chunk(payload) => {
                dropped += payload.len();
                false
            }
            _ => true,
        });
        if !inner.writer_closed {
            inner
                .buffer
                .push_back(TunnelMessage::Error(reason.to_string()));
            inner.writer_closed = true;
            inner.terminal = Some(TunnelMessage::Error(reason.to_string()));
        }
        inner.state = TunnelState::Closed;
        drop(inner);
        self.release_mem(dropped);
        debug!("{} closed: {}", self.id, reason);
        self.cv.notify_all();
    }

    /// Connect the receiver side. Exactly one attach may succeed; an
    /// attach arriving past the deadline on a tunnel that has produced
    /// nothing fails and the producer is told to fail fast.
    pub fn attach(self: &Arc<Self>) -> MppResult<TunnelReceiver> {
        let timed_out = {
            let mut inner = self.inner.lock().expect("tunnel lock");
            if inner.reader_attached {
                return Err(MppError::AlreadyAttached(self.id));
            }
            let late = match self.timeout {
                Some(timeout) => {
                    inner.state == TunnelState::Unconnected
                        && self.registered_at.elapsed() >= timeout
                        && inner.buffer.is_empty()
                        && !inner.writer_closed
                }
                None => false,
            };
            if !late {
                inner.reader_attached = true;
                if inner.state == TunnelState::Unconnected {
                    inner.state = TunnelState::Connected;
                }
                self.cv.notify_all();
            }
            late
        };
        if timed_out {
            let err = MppError::AttachTimeout(self.id);
            if let Some(task) = self.task.lock().expect("tunnel task ref lock").upgrade() {
                task.on_tunnel_attach_timeout(self.id, &err.to_string());
            }
            self.close(&err.to_string());
            return Err(err);
        }
        debug!("{} connected", self.id);
        Ok(TunnelReceiver {
            tunnel: Arc::clone(self),
        })
    }
}

/// Receiver half handed to the transport when a downstream peer connects.
pub struct TunnelReceiver {
    tunnel: Arc<Tunnel>,
}

impl TunnelReceiver {
    pub fn id(&self) -> TunnelId {
        self.tunnel.id
    }

    /// Next message in write order. Returns `None` once the terminal has
    /// been delivered.
    pub fn recv(&self) -> Option<TunnelMessage> {
        let mut inner = self.tunnel.inner.lock().expect("tunnel lock");
        loop {
            if let Some(msg) = inner.buffer.pop_front() {
                match &msg {
                    TunnelMessage::Chunk(payload) => {
                        let bytes = payload.len();
                        drop(inner);
                        self.tunnel.release_mem(bytes);
                        // Wake a producer blocked on the full queue.
                        self.tunnel.cv.notify_all();
                        return Some(msg);
                    }
                    TunnelMessage::End => {
                        inner.terminal_delivered = true;
                        if inner.state != TunnelState::Closed {
                            inner.state = TunnelState::Finished;
                        }
                        return Some(msg);
                    }
                    TunnelMessage::Error(_) => {
                        inner.terminal_delivered = true;
                        inner.state = TunnelState::Closed;
                        return Some(msg);
                    }
                }
            }
            if inner.terminal_delivered {
                return None;
            }
            let (next, _) = self
                .tunnel
                .cv
                .wait_timeout(inner, TUNNEL_WAIT_LOG_INTERVAL)
                .expect("tunnel wait");
            inner = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Tunnel, TunnelMessage, TunnelState};
    use crate::common::error::MppError;
    use crate::common::ids::{TaskId, TunnelId};

    fn tunnel(timeout: Option<Duration>, capacity: usize) -> Arc<Tunnel> {
        let id = TunnelId::new(TaskId::new(1, 0), TaskId::new(1, 1));
        Arc::new(Tunnel::new(id, timeout, capacity, None))
    }

    #[test]
    fn delivers_chunks_in_write_order_with_one_terminal() {
        let tunnel = tunnel(None, 8);
        let receiver = tunnel.attach().expect("attach");
        tunnel.write(vec![1]).expect("write");
        tunnel.write(vec![2]).expect("write");
        tunnel.write_end().expect("end");

        assert_eq!(receiver.recv(), Some(TunnelMessage::Chunk(vec![1])));
        assert_eq!(receiver.recv(), Some(TunnelMessage::Chunk(vec![2])));
        assert_eq!(receiver.recv(), Some(TunnelMessage::End));
        assert_eq!(receiver.recv(), None);
        assert_eq!(tunnel.state(), TunnelState::Finished);
        assert!(tunnel.write(vec![3]).is_err());
    }

    #[test]
    fn second_attach_fails() {
        let tunnel = tunnel(None, 8);
        let _receiver = tunnel.attach().expect("attach");
        match tunnel.attach().err() {
            Some(MppError::AlreadyAttached(_)) => {}
            other => panic!("unexpected attach result: {other:?}"),
        }
    }

    #[test]
    fn write_times_out_when_receiver_never_attaches() {
        let tunnel = tunnel(Some(Duration::from_millis(50)), 8);
        match tunnel.write(vec![1]) {
            Err(MppError::AttachTimeout(_)) => {}
            other => panic!("unexpected write result: {other:?}"),
        }
    }

    #[test]
    fn close_drops_chunks_and_reports_error_terminal() {
        let tunnel = tunnel(None, 8);
        let receiver = tunnel.attach().expect("attach");
        tunnel.write(vec![1]).expect("write");
        tunnel.close("query cancelled");
        tunnel.close("query cancelled");

        assert_eq!(
            receiver.recv(),
            Some(TunnelMessage::Error("query cancelled".to_string()))
        );
        assert_eq!(receiver.recv(), None);
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[test]
    fn second_error_is_discarded() {
        let tunnel = tunnel(None, 8);
        let receiver = tunnel.attach().expect("attach");
        tunnel.write_error("first");
        tunnel.write_error("second");
        assert_eq!(
            receiver.recv(),
            Some(TunnelMessage::Error("first".to_string()))
        );
        assert_eq!(receiver.recv(), None);
    }

    #[test]
    fn full_buffer_blocks_until_receiver_drains() {
        let tunnel = tunnel(None, 1);
        let receiver = tunnel.attach().expect("attach");
        tunnel.write(vec![1]).expect("write");

        let writer = {
            let tunnel = Arc::clone(&tunnel);
            std::thread::spawn(move || tunnel.write(vec![2]))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished(), "writer should be backpressured");

        assert_eq!(receiver.recv(), Some(TunnelMessage::Chunk(vec![1])));
        writer.join().expect("join").expect("write");
        assert_eq!(receiver.recv(), Some(TunnelMessage::Chunk(vec![2])));
    }

    #[test]
    fn wait_for_attach_returns_once_connected() {
        let tunnel = tunnel(Some(Duration::from_secs(5)), 8);
        let waiter = {
            let tunnel = Arc::clone(&tunnel);
            std::thread::spawn(move || tunnel.wait_for_attach())
        };
        std::thread::sleep(Duration::from_millis(20));
        let _receiver = tunnel.attach().expect("attach");
        waiter.join().expect("join").expect("connected");
    }

    #[test]
    fn late_attach_succeeds_when_producer_already_wrote() {
        let tunnel = tunnel(Some(Duration::from_millis(10)), 8);
        tunnel.write_end().expect("end");
        std::thread::sleep(Duration::from_millis(30));
        let receiver = tunnel.attach().expect("late attach with produced data");
        assert_eq!(receiver.recv(), Some(TunnelMessage::End));
    }

    #[test]
    fn late_attach_fails_on_idle_tunnel() {
        let tunnel = tunnel(Some(Duration::from_millis(10)), 8);
        std::thread::sleep(Duration::from_millis(30));
        match tunnel.attach().err() {
            Some(MppError::AttachTimeout(_)) => {}
            other => panic!("unexpected attach result: {other:?}"),
        }
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }
}
