//! Per-extent protocol wrapper
//!
//! An [`ExtentStream`] is the session a blob keeps for one of its extents.
//! It resolves the extent's primary node, takes a pooled channel to it and
//! hands the request either to the dispatch pool or, for callers that wait
//! anyway, straight to the transport.
//!
//! Resolution failures never reach the pool: the request completes at once
//! with an internal error.

use crate::connection::{SharedConnectionPool, get_or_connect};
use crate::dispatch::DispatchPool;
use crate::request::PhysicalRequest;
use crate::router::Router;
use crate::transport::{ExtentIo, ExtentTransport, IssueTask, TransportKind};
use crate::wire::ExtentChannel;
use blobio_common::{Error, ExtentId, IoKind, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, error};

/// How a request is handed to its transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueMode {
    /// Through the dispatch pool, when the blob has one
    Pooled,
    /// On the calling thread
    Inline,
}

/// Collaborators shared by every extent stream of a blob
pub struct StreamContext {
    pub router: Arc<dyn Router>,
    pub connections: SharedConnectionPool,
    pub dispatcher: Option<Arc<DispatchPool>>,
    pub live: Arc<dyn ExtentTransport>,
    pub null: Arc<dyn ExtentTransport>,
}

impl StreamContext {
    fn transport(&self, kind: TransportKind) -> &Arc<dyn ExtentTransport> {
        match kind {
            TransportKind::Live => &self.live,
            TransportKind::Null => &self.null,
        }
    }
}

/// Read/write session for one extent
pub struct ExtentStream {
    extent_id: ExtentId,
    ctx: Arc<StreamContext>,
    transport: AtomicU8,
}

impl ExtentStream {
    pub fn new(extent_id: ExtentId, ctx: Arc<StreamContext>, kind: TransportKind) -> Self {
        debug!(extent = %extent_id, transport = %kind, "extent stream opened");
        Self {
            extent_id,
            ctx,
            transport: AtomicU8::new(kind as u8),
        }
    }

    pub fn extent_id(&self) -> ExtentId {
        self.extent_id
    }

    pub fn transport_kind(&self) -> TransportKind {
        TransportKind::from_u8(self.transport.load(Ordering::Acquire))
    }

    /// Switch transports. Requests already issued keep the old one.
    pub fn set_transport(&self, kind: TransportKind) {
        self.transport.store(kind as u8, Ordering::Release);
    }

    pub fn async_read(&self, request: Arc<PhysicalRequest>, mode: IssueMode) {
        debug_assert_eq!(request.kind(), IoKind::Read);
        self.submit(request, mode);
    }

    pub fn async_write(&self, request: Arc<PhysicalRequest>, mode: IssueMode) {
        debug_assert_eq!(request.kind(), IoKind::Write);
        self.submit(request, mode);
    }

    fn submit(&self, request: Arc<PhysicalRequest>, mode: IssueMode) {
        debug_assert_eq!(request.extent_id(), self.extent_id);
        let transport = Arc::clone(self.ctx.transport(self.transport_kind()));

        let channel = if transport.needs_channel() {
            match self.resolve() {
                Ok(channel) => Some(channel),
                Err(e) => {
                    error!(extent = %self.extent_id, "{e}");
                    request.fail(e);
                    return;
                }
            }
        } else {
            None
        };

        let stats = self.ctx.dispatcher.as_ref().map(|d| d.stats());
        let io = ExtentIo::new(request, channel, stats);

        match (mode, &self.ctx.dispatcher) {
            (IssueMode::Pooled, Some(pool)) => {
                pool.push(self.extent_id.as_u64(), Box::new(IssueTask { transport, io }));
            }
            _ => transport.issue(io),
        }
    }

    /// Primary node channel for this extent
    fn resolve(&self) -> Result<Arc<dyn ExtentChannel>> {
        let route = self
            .ctx
            .router
            .query_router(self.extent_id)
            .map_err(|e| Error::internal(format!("resolve {}: {e}", self.extent_id)))?;
        get_or_connect(&self.ctx.connections, &route.primary).map_err(|e| {
            Error::internal(format!(
                "connect {} for {}: {e}",
                route.primary.node_id, self.extent_id
            ))
        })
    }
}

impl std::fmt::Debug for ExtentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentStream")
            .field("extent_id", &self.extent_id)
            .field("transport", &self.transport_kind())
            .finish()
    }
}
