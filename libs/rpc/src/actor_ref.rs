//! Per-partition submission handle
//!
//! A [`PartitionActorRef`] is the only way requests leave a client: it pins a
//! partition id to the connection serving it. [`PartitionActorRef::submit`]
//! never blocks; it returns a [`ResponseFuture`] that owns the request's wait
//! budget.
//!
//! The deadline is enforced by the caller's runtime, not by the destination
//! reactor. A reactor that stops draining its inbox therefore cannot hold a
//! caller past its timeout; the request buffer it still holds is released
//! when the reactor finally looks at the abandoned request.

use crate::channel::RequestChannel;
use crate::error::{Result, RpcError};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tpc_codec::{Frame, IoBuffer};
use tpc_network::Reactor;

/// Handle for submitting frames to one partition
#[derive(Clone)]
pub struct PartitionActorRef {
    partition_id: u32,
    channel: Arc<RequestChannel>,
    timeout: Duration,
}

impl PartitionActorRef {
    pub(crate) fn new(partition_id: u32, channel: Arc<RequestChannel>, timeout: Duration) -> Self {
        Self {
            partition_id,
            channel,
            timeout,
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Address of the server owning the partition
    pub fn address(&self) -> SocketAddr {
        self.channel.address()
    }

    /// Client reactor the partition's connection lives on
    pub fn reactor(&self) -> &Reactor {
        self.channel.reactor()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit a complete request frame with the default timeout
    pub fn submit(&self, request: IoBuffer) -> Result<ResponseFuture> {
        self.submit_with_timeout(request, self.timeout)
    }

    /// Submit with an explicit wait budget; callable from any thread
    pub fn submit_with_timeout(&self, request: IoBuffer, timeout: Duration) -> Result<ResponseFuture> {
        let (reply, rx) = oneshot::channel();
        self.channel.submit(self.partition_id, request, reply)?;
        Ok(ResponseFuture::new(self.partition_id, rx, timeout))
    }
}

impl fmt::Debug for PartitionActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionActorRef")
            .field("partition_id", &self.partition_id)
            .field("address", &self.channel.address())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Response to one submitted request
///
/// Resolves exactly once: with the response frame, a timeout, or the error
/// that closed the connection. Must be polled inside a tokio runtime.
/// Dropping it abandons the request.
#[must_use = "dropping a ResponseFuture abandons the request"]
pub struct ResponseFuture {
    partition_id: u32,
    rx: oneshot::Receiver<std::result::Result<Frame, RpcError>>,
    timeout: Duration,
    deadline: Instant,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ResponseFuture {
    pub(crate) fn new(
        partition_id: u32,
        rx: oneshot::Receiver<std::result::Result<Frame, RpcError>>,
        timeout: Duration,
    ) -> Self {
        Self {
            partition_id,
            rx,
            timeout,
            deadline: Instant::now() + timeout,
            sleep: None,
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }
}

impl Future for ResponseFuture {
    type Output = std::result::Result<Frame, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => return Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(RpcError::ConnectionClosed {
                    partition_id: this.partition_id,
                }))
            }
            Poll::Pending => {}
        }

        let deadline = this.deadline;
        let sleep = this.sleep.get_or_insert_with(|| {
            Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)))
        });
        ready!(sleep.as_mut().poll(cx));

        // Close first so nothing can arrive after the check below
        this.rx.close();
        if let Ok(result) = this.rx.try_recv() {
            return Poll::Ready(result);
        }
        Poll::Ready(Err(RpcError::Timeout {
            partition_id: this.partition_id,
            timeout_ms: this.timeout.as_millis() as u64,
        }))
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("partition_id", &self.partition_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}
