//! Extent transports
//!
//! A transport takes a resolved extent request and starts it. It never
//! waits for the answer: [`LiveTransport`] runs the RPC on a tokio runtime
//! and completes the request from one of that runtime's threads;
//! [`NullTransport`] completes every request immediately without touching
//! the network, which isolates client-side cost when benchmarking.

use crate::dispatch::DispatchItem;
use crate::request::PhysicalRequest;
use crate::stats::DispatchStats;
use crate::wire::{ExtentChannel, ReadResponse, STATUS_OK, WireRequest, WriteResponse};
use blobio_common::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Which transport a stream issues through
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportKind {
    #[default]
    Live = 0,
    Null = 1,
}

impl TransportKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Null => "null",
        }
    }

    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Null,
            _ => Self::Live,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Starts extent requests
pub trait ExtentTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether requests must be routed to a node channel first
    fn needs_channel(&self) -> bool;

    /// Start `io`. Must return without waiting for the answer.
    fn issue(&self, io: ExtentIo);
}

/// A physical request bound to its wire form and node channel.
///
/// Dropping an `ExtentIo` whose request never completed fails that request,
/// so a task lost to runtime shutdown still reaches its caller.
pub struct ExtentIo {
    request: Arc<PhysicalRequest>,
    wire: WireRequest,
    channel: Option<Arc<dyn ExtentChannel>>,
    stats: Option<Arc<DispatchStats>>,
}

impl ExtentIo {
    pub(crate) fn new(
        request: Arc<PhysicalRequest>,
        channel: Option<Arc<dyn ExtentChannel>>,
        stats: Option<Arc<DispatchStats>>,
    ) -> Self {
        let wire = request.wire_request();
        Self {
            request,
            wire,
            channel,
            stats,
        }
    }

    pub fn request(&self) -> &Arc<PhysicalRequest> {
        &self.request
    }

    pub fn wire(&self) -> &WireRequest {
        &self.wire
    }

    pub fn channel(&self) -> Option<&Arc<dyn ExtentChannel>> {
        self.channel.as_ref()
    }

    fn timed<F: FnOnce(&PhysicalRequest) -> bool>(&self, f: F) -> bool {
        let start = Instant::now();
        let done = f(&self.request);
        if let Some(stats) = &self.stats {
            stats.record_callback(start.elapsed());
        }
        done
    }

    pub fn complete_read(&self, response: Result<ReadResponse>) -> bool {
        self.timed(|r| r.complete_read(response))
    }

    pub fn complete_write(&self, response: Result<WriteResponse>) -> bool {
        self.timed(|r| r.complete_write(response))
    }

    pub fn fail(&self, error: Error) -> bool {
        self.timed(|r| r.fail(error))
    }
}

impl Drop for ExtentIo {
    fn drop(&mut self) {
        if !self.request.is_completed()
            && self
                .request
                .fail(Error::RpcFailed("request dropped before completion".into()))
        {
            warn!(extent = %self.request.extent_id(), "extent request dropped unfinished");
        }
    }
}

/// Pool item: an extent request plus the transport it was bound to
pub(crate) struct IssueTask {
    pub(crate) transport: Arc<dyn ExtentTransport>,
    pub(crate) io: ExtentIo,
}

impl DispatchItem for IssueTask {
    fn issue(self: Box<Self>) {
        let Self { transport, io } = *self;
        transport.issue(io);
    }

    fn expire(self: Box<Self>) {
        debug!(extent = %self.io.request().extent_id(), "extent request expired");
        self.io.fail(Error::DeviceClosed);
    }
}

/// Issues requests over node channels on a tokio runtime
#[derive(Clone, Debug)]
pub struct LiveTransport {
    runtime: Handle,
}

impl LiveTransport {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl ExtentTransport for LiveTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Live
    }

    fn needs_channel(&self) -> bool {
        true
    }

    fn issue(&self, io: ExtentIo) {
        let Some(channel) = io.channel().cloned() else {
            io.fail(Error::internal("live transport issued without a channel"));
            return;
        };
        self.runtime.spawn(async move {
            match io.wire() {
                WireRequest::Read(req) => {
                    let response = channel.read(req.clone()).await;
                    io.complete_read(response);
                }
                WireRequest::Write(req) => {
                    let response = channel.write(req.clone()).await;
                    io.complete_write(response);
                }
            }
        });
    }
}

/// Completes every request at once; reads return zeroes
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTransport;

impl ExtentTransport for NullTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Null
    }

    fn needs_channel(&self) -> bool {
        false
    }

    fn issue(&self, io: ExtentIo) {
        match io.wire() {
            WireRequest::Read(req) => {
                let payload = Bytes::from(vec![0u8; req.size as usize]);
                io.complete_read(Ok(ReadResponse {
                    status: STATUS_OK,
                    payload,
                    content_checksum: None,
                }));
            }
            WireRequest::Write(_) => {
                io.complete_write(Ok(WriteResponse { status: STATUS_OK }));
            }
        }
    }
}
