//! Request/response correlation
//!
//! Each connection keeps a FIFO of pending requests. A partition server
//! answers the requests of one connection in arrival order, so the oldest
//! pending entry is always the one a response belongs to. Entries whose
//! caller gave up (timed out or dropped the future) stay in the queue until
//! their response arrives, which keeps the queue aligned with the wire; the
//! response is then discarded.
//!
//! The queue is only touched on the connection's reactor thread. The lock is
//! there to make the shared handle `Send`, not for contention.

use crate::error::RpcError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tpc_codec::Frame;
use tpc_network::{AsyncSocket, FrameHandler};
use tracing::{debug, trace, warn};

/// Completion side of a submitted request
pub(crate) type Reply = oneshot::Sender<Result<Frame, RpcError>>;

pub(crate) struct PendingRequest {
    pub(crate) partition_id: u32,
    pub(crate) reply: Reply,
    pub(crate) submitted_at: Instant,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    queue: Mutex<VecDeque<PendingRequest>>,
}

impl PendingRequests {
    pub(crate) fn push(&self, request: PendingRequest) {
        self.queue.lock().push_back(request);
    }

    pub(crate) fn pop_front(&self) -> Option<PendingRequest> {
        self.queue.lock().pop_front()
    }

    /// Undo the latest push after its write was rejected
    pub(crate) fn pop_back(&self) -> Option<PendingRequest> {
        self.queue.lock().pop_back()
    }

    pub(crate) fn drain(&self) -> Vec<PendingRequest> {
        self.queue.lock().drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Client-side frame handler completing pending requests
pub(crate) struct ResponseHandler {
    pending: Arc<PendingRequests>,
}

impl ResponseHandler {
    pub(crate) fn new(pending: Arc<PendingRequests>) -> Self {
        Self { pending }
    }
}

impl FrameHandler for ResponseHandler {
    fn on_frame(&mut self, frame: Frame, socket: &AsyncSocket) -> tpc_network::Result<()> {
        let Some(request) = self.pending.pop_front() else {
            warn!(
                socket = %socket,
                partition_id = frame.partition_id(),
                opcode = ?frame.opcode(),
                "Response without a pending request; discarded"
            );
            return Ok(());
        };

        if request.reply.is_closed() {
            debug!(
                socket = %socket,
                partition_id = request.partition_id,
                "Response for an abandoned request discarded"
            );
            return Ok(());
        }

        let result = if frame.partition_id() == request.partition_id {
            Ok(frame)
        } else {
            warn!(
                socket = %socket,
                expected = request.partition_id,
                actual = frame.partition_id(),
                "Response for the wrong partition"
            );
            Err(RpcError::unexpected_response(
                format!("partition {}", request.partition_id),
                format!("partition {}", frame.partition_id()),
            ))
        };
        trace!(
            socket = %socket,
            partition_id = request.partition_id,
            latency_us = request.submitted_at.elapsed().as_micros() as u64,
            "Response correlated"
        );
        // A receiver dropped since the check above drops the frame here
        let _ = request.reply.send(result);
        Ok(())
    }

    fn on_close(&mut self, socket: &AsyncSocket) {
        let failed = self.pending.drain();
        if failed.is_empty() {
            return;
        }
        debug!(socket = %socket, count = failed.len(), "Failing requests of closed connection");
        for request in failed {
            let _ = request.reply.send(Err(RpcError::ConnectionClosed {
                partition_id: request.partition_id,
            }));
        }
    }
}
