//! Blob streams
//!
//! A [`BlobStream`] is an open blob. It validates each call, cuts it at
//! extent boundaries, hands the pieces to per-extent [`ExtentStream`]s and
//! joins their results into one completion.
//!
//! Extent streams are created on first use and cached for the life of the
//! handle. The cache is a concurrent map filled with insert-if-absent, so
//! two callers touching a fresh extent at once share one stream.
//!
//! Every accepted call holds the handle's in-flight count until its
//! callback has run. [`BlobStream::close`] refuses new calls, waits for
//! that count to drain and then drops the extent streams.

use crate::connection::SharedConnectionPool;
use crate::dispatch::DispatchPool;
use crate::protocol::{ExtentStream, IssueMode, StreamContext};
use crate::request::{
    IoCallback, IoCompletion, LogicalRequest, PhysicalRequest, RequestOwner, split_request,
};
use crate::router::Router;
use crate::scheduler::{IoRange, RangeScheduler};
use crate::stats::IoStats;
use crate::transport::{ExtentTransport, LiveTransport, NullTransport, TransportKind};
use blobio_common::{BlobId, Error, ExtentId, ExtentIndex, IoKind, Result, StreamConfig};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Everything needed to open a blob
pub struct BlobStreamOptions {
    pub blob_id: BlobId,
    pub name: String,
    /// Blob size in bytes
    pub size: u64,
    pub pool_id: u32,
    pub user_id: u32,
    pub stream: StreamConfig,
    pub router: Arc<dyn Router>,
    pub connections: SharedConnectionPool,
    /// Without a pool every request is issued on the calling thread
    pub dispatcher: Option<Arc<DispatchPool>>,
    /// Runtime for the live transport; the current one when `None`
    pub runtime: Option<Handle>,
    pub transport: TransportKind,
}

enum Payload {
    Read(BytesMut),
    Write(Bytes),
}

impl Payload {
    fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(data) => data.len(),
        }
    }

    const fn kind(&self) -> IoKind {
        match self {
            Self::Read(_) => IoKind::Read,
            Self::Write(_) => IoKind::Write,
        }
    }
}

struct BlobShared {
    blob_id: BlobId,
    name: String,
    size: u64,
    pool_id: u32,
    user_id: u32,
    config: StreamConfig,
    ctx: Arc<StreamContext>,
    streams: DashMap<ExtentIndex, Arc<ExtentStream>>,
    transport: AtomicU8,
    inflight: AtomicU64,
    idle_lock: Mutex<()>,
    idle: Condvar,
    closed: AtomicBool,
    scheduler: Option<RangeScheduler>,
    stats: IoStats,
    next_request_id: AtomicU64,
}

impl BlobShared {
    fn validate(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::invalid_argument("zero-length request"));
        }
        if len > self.config.max_io_size {
            return Err(Error::invalid_argument(format!(
                "request of {len} bytes exceeds max_io_size {}",
                self.config.max_io_size
            )));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                length: len,
                size: self.size,
            }),
        }
    }

    fn stream(&self, index: ExtentIndex) -> Arc<ExtentStream> {
        if let Some(stream) = self.streams.get(&index) {
            return Arc::clone(stream.value());
        }
        let entry = self.streams.entry(index).or_insert_with(|| {
            Arc::new(ExtentStream::new(
                ExtentId::new(self.blob_id, index),
                Arc::clone(&self.ctx),
                TransportKind::from_u8(self.transport.load(Ordering::Acquire)),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Count a new request in, unless the handle is closing
    fn acquire_inflight(&self) -> bool {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.release_inflight();
            return false;
        }
        true
    }

    fn release_inflight(&self) {
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut guard = self.idle_lock.lock();
        while self.inflight.load(Ordering::SeqCst) > 0 {
            self.idle.wait(&mut guard);
        }
    }
}

impl RequestOwner for BlobShared {
    fn request_finished(&self, request: &LogicalRequest, result: &Result<()>) {
        self.stats.record(
            request.kind(),
            request.len(),
            request.started().elapsed(),
            request.is_split(),
            result.is_ok(),
        );
        if matches!(result, Err(Error::ChecksumMismatch { .. })) {
            self.stats.record_checksum_error();
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.complete(IoRange::new(request.offset(), request.len()));
        }
        self.release_inflight();
    }
}

/// An open blob
pub struct BlobStream {
    shared: Arc<BlobShared>,
}

impl BlobStream {
    pub fn open(options: BlobStreamOptions) -> Result<Self> {
        options.stream.validate()?;
        if options.size == 0 {
            return Err(Error::invalid_argument(format!(
                "blob {} has zero size",
                options.blob_id
            )));
        }

        let runtime = match options.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                Error::configuration("the live transport needs a tokio runtime handle")
            })?,
        };
        let live: Arc<dyn ExtentTransport> = Arc::new(LiveTransport::new(runtime));
        let null: Arc<dyn ExtentTransport> = Arc::new(NullTransport);

        let ctx = Arc::new(StreamContext {
            router: options.router,
            connections: options.connections,
            dispatcher: options.dispatcher,
            live,
            null,
        });

        let scheduler = options
            .stream
            .serialize_overlapping
            .then(|| RangeScheduler::new(options.stream.max_io_size));

        info!(
            blob = %options.blob_id,
            name = %options.name,
            size = options.size,
            extent_size = options.stream.extent_size,
            transport = %options.transport,
            pooled = ctx.dispatcher.is_some(),
            serialized = scheduler.is_some(),
            "blob opened"
        );

        Ok(Self {
            shared: Arc::new(BlobShared {
                blob_id: options.blob_id,
                name: options.name,
                size: options.size,
                pool_id: options.pool_id,
                user_id: options.user_id,
                config: options.stream,
                ctx,
                streams: DashMap::new(),
                transport: AtomicU8::new(options.transport as u8),
                inflight: AtomicU64::new(0),
                idle_lock: Mutex::new(()),
                idle: Condvar::new(),
                closed: AtomicBool::new(false),
                scheduler,
                stats: IoStats::new(),
                next_request_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn blob_id(&self) -> BlobId {
        self.shared.blob_id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn size(&self) -> u64 {
        self.shared.size
    }

    pub fn pool_id(&self) -> u32 {
        self.shared.pool_id
    }

    pub fn user_id(&self) -> u32 {
        self.shared.user_id
    }

    pub fn extent_size(&self) -> u64 {
        self.shared.config.extent_size
    }

    pub fn max_io_size(&self) -> u64 {
        self.shared.config.max_io_size
    }

    pub fn optimal_io_size(&self) -> u64 {
        self.shared.config.optimal_io_size
    }

    pub fn stats(&self) -> &IoStats {
        &self.shared.stats
    }

    /// Accepted requests whose callback has not run yet
    pub fn inflight_io_number(&self) -> u64 {
        self.shared.inflight.load(Ordering::SeqCst)
    }

    /// Extent streams opened so far
    pub fn cached_streams(&self) -> usize {
        self.shared.streams.len()
    }

    /// Requests parked behind an overlapping one
    pub fn pending_requests(&self) -> usize {
        self.shared
            .scheduler
            .as_ref()
            .map_or(0, RangeScheduler::pending_len)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn transport_kind(&self) -> TransportKind {
        TransportKind::from_u8(self.shared.transport.load(Ordering::Acquire))
    }

    /// Switch every extent stream, current and future, to `kind`.
    ///
    /// Requests already issued finish on the transport they started on.
    pub fn set_transport(&self, kind: TransportKind) {
        self.shared.transport.store(kind as u8, Ordering::Release);
        for stream in self.shared.streams.iter() {
            stream.value().set_transport(kind);
        }
        info!(blob = %self.shared.blob_id, transport = %kind, "transport switched");
    }

    /// Start a read into `buf` at `offset`.
    ///
    /// `Ok` means the request was accepted and `callback` will run exactly
    /// once with the buffer; on `Err` the callback is dropped unrun.
    pub fn async_read<F>(&self, buf: BytesMut, offset: u64, callback: F) -> Result<()>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit(Payload::Read(buf), offset, Box::new(callback), IssueMode::Pooled)
    }

    /// Start a write of `data` at `offset`. Same contract as [`Self::async_read`].
    pub fn async_write<F>(&self, data: Bytes, offset: u64, callback: F) -> Result<()>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit(Payload::Write(data), offset, Box::new(callback), IssueMode::Pooled)
    }

    /// Read `buf.len()` bytes at `offset`, blocking the calling thread.
    ///
    /// On an integrity error `buf` still holds the bytes received.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let completion = self.wait(Payload::Read(BytesMut::zeroed(buf.len())), offset)?;
        if let Some(data) = &completion.buffer
            && data.len() == buf.len()
        {
            buf.copy_from_slice(data);
        }
        completion.result
    }

    /// Write `data` at `offset`, blocking the calling thread
    pub fn write(&self, data: &[u8], offset: u64) -> Result<()> {
        self.wait(Payload::Write(Bytes::copy_from_slice(data)), offset)?
            .result
    }

    /// Refuse new requests, wait for in-flight ones, drop extent streams.
    ///
    /// Idempotent. Must not be called from a completion callback of this
    /// blob, which would wait on itself.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            blob = %shared.blob_id,
            inflight = shared.inflight.load(Ordering::SeqCst),
            "closing blob"
        );
        shared.wait_idle();
        let streams = shared.streams.len();
        shared.streams.clear();
        info!(blob = %shared.blob_id, streams, "blob closed");
    }

    fn wait(&self, payload: Payload, offset: u64) -> Result<IoCompletion> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(
            payload,
            offset,
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
            IssueMode::Inline,
        )?;
        rx.recv()
            .map_err(|_| Error::internal("completion dropped without running"))
    }

    fn submit(
        &self,
        payload: Payload,
        offset: u64,
        callback: IoCallback,
        mode: IssueMode,
    ) -> Result<()> {
        let shared = &self.shared;
        let kind = payload.kind();
        let len = payload.len() as u64;

        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::DeviceClosed);
        }
        shared.validate(offset, len)?;
        let slices = split_request(shared.config.extent_size, offset, len)?;

        if !shared.acquire_inflight() {
            return Err(Error::DeviceClosed);
        }

        let id = shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let owner: Arc<dyn RequestOwner> = Arc::clone(shared) as Arc<dyn RequestOwner>;
        let logical = Arc::new(LogicalRequest::new(
            id,
            kind,
            offset,
            len,
            slices.len(),
            callback,
            owner,
        ));

        let mut parts: Vec<(Arc<ExtentStream>, Arc<PhysicalRequest>)> =
            Vec::with_capacity(slices.len());
        match payload {
            Payload::Read(mut buf) => {
                let mut bufs = Vec::with_capacity(slices.len());
                if let [_, tail] = slices.as_slice() {
                    let rest = buf.split_off(tail.buf_offset as usize);
                    bufs.push(buf);
                    bufs.push(rest);
                } else {
                    bufs.push(buf);
                }
                for (slot, (slice, buf)) in slices.iter().zip(bufs).enumerate() {
                    let stream = shared.stream(slice.index);
                    let request = PhysicalRequest::read(
                        Arc::clone(&logical),
                        slot,
                        stream.extent_id(),
                        slice,
                        buf,
                    );
                    parts.push((stream, Arc::new(request)));
                }
            }
            Payload::Write(data) => {
                for (slot, slice) in slices.iter().enumerate() {
                    let stream = shared.stream(slice.index);
                    let start = slice.buf_offset as usize;
                    let request = PhysicalRequest::write(
                        Arc::clone(&logical),
                        slot,
                        stream.extent_id(),
                        slice,
                        data.slice(start..start + slice.len as usize),
                    );
                    parts.push((stream, Arc::new(request)));
                }
            }
        }

        debug!(
            request = id,
            blob = %shared.blob_id,
            %kind,
            offset,
            len,
            parts = parts.len(),
            "request accepted"
        );

        let Some(scheduler) = &shared.scheduler else {
            issue(parts, kind, mode);
            return Ok(());
        };

        let requests: Vec<Arc<PhysicalRequest>> =
            parts.iter().map(|(_, r)| Arc::clone(r)).collect();
        if let Err(e) = scheduler.admit_or_enqueue(
            IoRange::new(offset, len),
            Box::new(move |_| issue(parts, kind, mode)),
        ) {
            // Accepted already: the failure reaches the caller's callback
            for request in requests {
                request.fail(e.clone());
            }
        }
        Ok(())
    }
}

fn issue(parts: Vec<(Arc<ExtentStream>, Arc<PhysicalRequest>)>, kind: IoKind, mode: IssueMode) {
    for (stream, request) in parts {
        match kind {
            IoKind::Read => stream.async_read(request, mode),
            IoKind::Write => stream.async_write(request, mode),
        }
    }
}

impl Drop for BlobStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream")
            .field("blob_id", &self.shared.blob_id)
            .field("name", &self.shared.name)
            .field("size", &self.shared.size)
            .field("inflight", &self.inflight_io_number())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{NodeConnectionPool, shared_pool};
    use crate::router::StaticRouter;
    use crate::testing::{CountingConnector, Faults, MemoryCluster, MemoryNode};
    use blobio_common::{DispatchConfig, NodeAddr, NodeId, RouteEntry};
    use crossbeam_channel::Receiver;
    use std::thread;
    use std::time::Duration;
    use tokio::runtime::Runtime;

    const EXTENT: u64 = 64 * 1024;
    const BLOB_SIZE: u64 = 16 * EXTENT;
    const WAIT: Duration = Duration::from_secs(10);

    struct Harness {
        runtime: Runtime,
        node: Arc<MemoryNode>,
        router: Arc<StaticRouter>,
        connections: SharedConnectionPool,
        dispatcher: Option<Arc<DispatchPool>>,
    }

    impl Harness {
        fn new(pooled: bool) -> Self {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            let cluster = MemoryCluster::new();
            let addr = NodeAddr::new(NodeId::new(1), "127.0.0.1", 7000);
            let node = cluster.add_node(addr.clone());
            let router = Arc::new(StaticRouter::new());
            router.set_blob_route(BlobId::new(1), RouteEntry::primary_only(addr));
            let connections = shared_pool(NodeConnectionPool::new(CountingConnector::new(cluster)));
            let dispatcher = pooled.then(|| {
                Arc::new(
                    DispatchPool::new(DispatchConfig {
                        workers: 2,
                        ..DispatchConfig::default()
                    })
                    .unwrap(),
                )
            });
            Self {
                runtime,
                node,
                router,
                connections,
                dispatcher,
            }
        }

        fn stream_config(serialize: bool) -> StreamConfig {
            StreamConfig {
                extent_size: EXTENT,
                max_io_size: 4 * EXTENT,
                optimal_io_size: EXTENT,
                serialize_overlapping: serialize,
            }
        }

        fn open_blob(&self, blob: u64, stream: StreamConfig) -> BlobStream {
            BlobStream::open(BlobStreamOptions {
                blob_id: BlobId::new(blob),
                name: format!("blob-{blob}"),
                size: BLOB_SIZE,
                pool_id: 1,
                user_id: 1,
                stream,
                router: Arc::clone(&self.router) as Arc<dyn Router>,
                connections: Arc::clone(&self.connections),
                dispatcher: self.dispatcher.clone(),
                runtime: Some(self.runtime.handle().clone()),
                transport: TransportKind::Live,
            })
            .unwrap()
        }

        fn open(&self) -> BlobStream {
            self.open_blob(1, Self::stream_config(false))
        }
    }

    fn collector() -> (
        impl Fn() -> Box<dyn FnOnce(IoCompletion) + Send + 'static>,
        Receiver<IoCompletion>,
    ) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let make = move || {
            let tx = tx.clone();
            Box::new(move |c: IoCompletion| {
                let _ = tx.send(c);
            }) as Box<dyn FnOnce(IoCompletion) + Send + 'static>
        };
        (make, rx)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_write_read_across_extent_boundary() {
        for pooled in [false, true] {
            let h = Harness::new(pooled);
            let blob = h.open();
            let offset = 3 * EXTENT - 1000;
            let data = pattern(5000, 7);

            let (cb, rx) = collector();
            blob.async_write(Bytes::from(data.clone()), offset, cb()).unwrap();
            let done = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(done.result, Ok(()));
            assert!(done.buffer.is_none());

            let mut buf = vec![0u8; 5000];
            blob.read(&mut buf, offset).unwrap();
            assert_eq!(buf, data);

            // Each half landed in its own extent
            let head = h.node.extent_bytes(ExtentId::new(BlobId::new(1), 3), EXTENT - 1000, 1000);
            let tail = h.node.extent_bytes(ExtentId::new(BlobId::new(1), 4), 0, 4000);
            assert_eq!(head, data[..1000]);
            assert_eq!(tail, data[1000..]);

            assert_eq!(blob.stats().split_ops(), 2);
            assert_eq!(blob.cached_streams(), 2);
            assert_eq!(blob.inflight_io_number(), 0);
        }
    }

    #[test]
    fn test_async_read_returns_buffer() {
        let h = Harness::new(true);
        let blob = h.open();
        blob.write(&pattern(4096, 1), 8192).unwrap();

        let (cb, rx) = collector();
        blob.async_read(BytesMut::zeroed(4096), 8192, cb()).unwrap();
        let done = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(done.kind, IoKind::Read);
        assert_eq!(done.result, Ok(()));
        assert_eq!(done.buffer.unwrap().as_ref(), pattern(4096, 1).as_slice());
        assert_eq!(blob.stats().read_ops(), 1);
        assert_eq!(blob.stats().write_ops(), 1);
    }

    #[test]
    fn test_three_extent_request_rejected() {
        let h = Harness::new(true);
        let blob = h.open();

        let (cb, rx) = collector();
        let err = blob
            .async_write(Bytes::from(vec![1u8; (EXTENT + 2) as usize]), EXTENT - 1, cb())
            .unwrap_err();
        assert!(matches!(err, Error::DataTooLarge { .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(blob.inflight_io_number(), 0);
        assert_eq!(blob.cached_streams(), 0);
        assert_eq!(h.node.writes(), 0);
    }

    #[test]
    fn test_validation_errors() {
        let h = Harness::new(false);
        let blob = h.open();

        let mut empty = [0u8; 0];
        assert!(matches!(
            blob.read(&mut empty, 0),
            Err(Error::InvalidArgument(_))
        ));
        let mut buf = [0u8; 16];
        assert!(matches!(
            blob.read(&mut buf, BLOB_SIZE - 8),
            Err(Error::OutOfBounds { .. })
        ));
        let big = vec![0u8; (4 * EXTENT + 1) as usize];
        assert!(matches!(blob.write(&big, 0), Err(Error::InvalidArgument(_))));
        assert_eq!(blob.inflight_io_number(), 0);
    }

    #[test]
    fn test_checksum_mismatch_keeps_received_bytes() {
        let h = Harness::new(false);
        let blob = h.open();
        let data = pattern(1024, 3);
        blob.write(&data, 0).unwrap();

        h.node.set_faults(Faults {
            corrupt_checksum: true,
            ..Faults::default()
        });
        let mut buf = vec![0u8; 1024];
        let err = blob.read(&mut buf, 0).unwrap_err();
        assert!(err.is_integrity_error());
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(buf, data);
        assert_eq!(blob.stats().checksum_errors(), 1);
        assert_eq!(blob.stats().failed_ops(), 1);
    }

    #[test]
    fn test_remote_and_rpc_failures() {
        let h = Harness::new(true);
        let blob = h.open();

        h.node.set_faults(Faults {
            remote_status: Some(5),
            ..Faults::default()
        });
        assert_eq!(blob.write(&[1, 2, 3], 0), Err(Error::Remote { code: 5 }));

        h.node.set_faults(Faults {
            fail_rpc: true,
            ..Faults::default()
        });
        let (cb, rx) = collector();
        blob.async_read(BytesMut::zeroed(8), EXTENT - 4, cb()).unwrap();
        let done = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(done.result, Err(Error::RpcFailed(_))));
        assert_eq!(done.buffer.map(|b| b.len()), Some(8));
        assert_eq!(blob.inflight_io_number(), 0);
    }

    #[test]
    fn test_unroutable_extent_fails_without_queueing() {
        let h = Harness::new(true);
        // Blob 2 has no route
        let blob = h.open_blob(2, Harness::stream_config(false));

        let (cb, rx) = collector();
        blob.async_write(Bytes::from_static(b"abcd"), 0, cb()).unwrap();
        let done = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(done.result, Err(Error::Internal(_))));

        let stats = h.dispatcher.as_ref().unwrap().stats();
        assert_eq!(stats.pushed(), 0);
        assert_eq!(h.node.writes(), 0);
    }

    #[test]
    fn test_close_waits_for_inflight() {
        let h = Harness::new(true);
        let blob = Arc::new(h.open());
        h.node.set_faults(Faults {
            delay: Some(Duration::from_millis(100)),
            ..Faults::default()
        });

        let (cb, rx) = collector();
        for i in 0..8u64 {
            blob.async_write(Bytes::from(vec![i as u8; 512]), i * 4096, cb())
                .unwrap();
        }
        assert!(blob.inflight_io_number() > 0);

        let closer = {
            let blob = Arc::clone(&blob);
            thread::spawn(move || blob.close())
        };
        closer.join().unwrap();

        // Every callback ran before close returned
        assert_eq!(rx.try_iter().count(), 8);
        assert_eq!(blob.inflight_io_number(), 0);
        assert_eq!(blob.cached_streams(), 0);

        let (cb, rx) = collector();
        assert_eq!(
            blob.async_write(Bytes::from_static(b"x"), 0, cb()),
            Err(Error::DeviceClosed)
        );
        assert!(rx.try_recv().is_err());
        let mut buf = [0u8; 4];
        assert_eq!(blob.read(&mut buf, 0), Err(Error::DeviceClosed));
    }

    #[test]
    fn test_stopped_pool_completes_with_device_closed() {
        let h = Harness::new(true);
        let blob = h.open();
        h.dispatcher.as_ref().unwrap().stop();

        let (cb, rx) = collector();
        blob.async_write(Bytes::from_static(b"late"), 0, cb()).unwrap();
        let done = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(done.result, Err(Error::DeviceClosed));
        assert_eq!(h.node.writes(), 0);
        assert_eq!(blob.inflight_io_number(), 0);
    }

    #[test]
    fn test_null_transport_switch() {
        let h = Harness::new(true);
        let blob = h.open();
        blob.write(&pattern(64, 9), 0).unwrap();
        assert_eq!(h.node.writes(), 1);

        blob.set_transport(TransportKind::Null);
        assert_eq!(blob.transport_kind(), TransportKind::Null);
        let mut buf = vec![0xffu8; 64];
        blob.read(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        blob.write(&pattern(64, 1), 2 * EXTENT).unwrap();
        assert_eq!(h.node.reads(), 0);
        assert_eq!(h.node.writes(), 1);

        blob.set_transport(TransportKind::Live);
        blob.read(&mut buf, 0).unwrap();
        assert_eq!(buf, pattern(64, 9));
        assert_eq!(h.node.reads(), 1);
    }

    #[test]
    fn test_concurrent_first_access_shares_stream() {
        let h = Harness::new(true);
        let blob = Arc::new(h.open());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let blob = Arc::clone(&blob);
                thread::spawn(move || {
                    let mut buf = [0u8; 128];
                    blob.read(&mut buf, 5 * EXTENT + t * 128).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(blob.cached_streams(), 1);
    }

    #[test]
    fn test_every_callback_fires_once() {
        let h = Harness::new(true);
        let blob = h.open();
        let (cb, rx) = collector();

        let total = 200u64;
        for i in 0..total {
            // Every fourth request straddles a boundary
            let offset = if i % 4 == 0 {
                (i % 15 + 1) * EXTENT - 256
            } else {
                (i % 16) * EXTENT + 4096
            };
            if i % 2 == 0 {
                blob.async_write(Bytes::from(vec![i as u8; 512]), offset, cb())
                    .unwrap();
            } else {
                blob.async_read(BytesMut::zeroed(512), offset, cb()).unwrap();
            }
        }

        let completions: Vec<IoCompletion> = (0..total)
            .map(|_| rx.recv_timeout(WAIT).unwrap())
            .collect();
        assert!(completions.iter().all(|c| c.result.is_ok()));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        blob.close();
        assert_eq!(blob.stats().read_ops() + blob.stats().write_ops(), total);
        assert_eq!(blob.stats().split_ops(), total / 4);
    }

    #[test]
    fn test_overlapping_writes_run_in_order() {
        let h = Harness::new(true);
        let blob = h.open_blob(1, Harness::stream_config(true));
        h.node.set_faults(Faults {
            delay: Some(Duration::from_millis(50)),
            ..Faults::default()
        });

        let (cb, rx) = collector();
        blob.async_write(Bytes::from(vec![1u8; 4096]), 0, cb()).unwrap();
        blob.async_write(Bytes::from(vec![2u8; 4096]), 2048, cb()).unwrap();
        // Disjoint from both, so admitted at once
        blob.async_write(Bytes::from(vec![3u8; 4096]), 8192, cb()).unwrap();
        assert_eq!(blob.pending_requests(), 1);

        let mut offsets = Vec::new();
        for _ in 0..3 {
            offsets.push(rx.recv_timeout(WAIT).unwrap().offset);
        }
        let first = offsets.iter().position(|&o| o == 0).unwrap();
        let second = offsets.iter().position(|&o| o == 2048).unwrap();
        assert!(first < second);
        assert_eq!(blob.pending_requests(), 0);

        h.node.clear_faults();
        let mut buf = vec![0u8; 6144];
        blob.read(&mut buf, 0).unwrap();
        assert!(buf[..2048].iter().all(|&b| b == 1));
        assert!(buf[2048..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_write_overlapping_parked_write_runs_after_it() {
        let h = Harness::new(true);
        let blob = h.open_blob(1, Harness::stream_config(true));
        h.node.set_faults(Faults {
            delay: Some(Duration::from_millis(50)),
            ..Faults::default()
        });

        let (cb, rx) = collector();
        blob.async_write(Bytes::from(vec![1u8; 4096]), 0, cb()).unwrap();
        blob.async_write(Bytes::from(vec![2u8; 4096]), 2048, cb()).unwrap();
        // Clear of the running write, but overlaps the parked one
        blob.async_write(Bytes::from(vec![3u8; 4096]), 4096, cb()).unwrap();
        assert_eq!(blob.pending_requests(), 2);

        let offsets: Vec<u64> = (0..3)
            .map(|_| rx.recv_timeout(WAIT).unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![0, 2048, 4096]);

        h.node.clear_faults();
        let mut buf = vec![0u8; 8192];
        blob.read(&mut buf, 0).unwrap();
        assert!(buf[..2048].iter().all(|&b| b == 1));
        assert!(buf[2048..4096].iter().all(|&b| b == 2));
        assert!(buf[4096..].iter().all(|&b| b == 3));
    }

    #[test]
    fn test_read_without_node_checksum() {
        let h = Harness::new(true);
        let blob = h.open();
        let data = pattern(3000, 5);
        // Straddles extents 2 and 3
        blob.write(&data, 2 * EXTENT - 1000).unwrap();

        h.node.set_faults(Faults {
            omit_checksum: true,
            ..Faults::default()
        });
        let (cb, rx) = collector();
        blob.async_read(BytesMut::zeroed(3000), 2 * EXTENT - 1000, cb())
            .unwrap();
        let done = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(done.result, Ok(()));
        assert_eq!(done.buffer.unwrap().as_ref(), data.as_slice());
        assert_eq!(blob.stats().checksum_errors(), 0);
    }
}
