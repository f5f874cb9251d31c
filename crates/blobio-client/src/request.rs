//! Logical and physical requests
//!
//! A caller's read or write is a [`LogicalRequest`] against the blob address
//! space. It is cut at extent boundaries into one or two
//! [`PhysicalRequest`]s, each addressed to a single extent.
//!
//! ```text
//!              blob offset O, length L, extent size E
//!   |------ extent k ------|------ extent k+1 ------|
//!               [=== slot 0 ===][==== slot 1 ====]
//!               O             k*E              O+L
//! ```
//!
//! Completion is joined with two atomics:
//!
//! - every physical request carries a guard flipped with `swap`, so its
//!   completion body runs once even if the transport signals it twice;
//! - the logical request counts outstanding physical requests, and only the
//!   `fetch_sub` that takes the count from 1 to 0 finishes it.
//!
//! The first error reported by any slot is kept; later ones are logged and
//! dropped. Read buffers are split from the caller's buffer and joined back
//! with `unsplit`, so bytes copied before a failure are still returned.

use crate::wire::{ReadRequest, ReadResponse, STATUS_OK, WireRequest, WriteRequest, WriteResponse};
use blobio_common::{
    Error, ExtentId, ExtentIndex, IoKind, Result, content_checksum, header_checksum,
    verify_content,
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Most extents a single logical request may touch
pub const MAX_SLICES: usize = 2;

/// The part of a logical request that falls inside one extent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentSlice {
    /// 1-based extent index within the blob
    pub index: ExtentIndex,
    /// Offset inside the extent
    pub extent_offset: u64,
    pub len: u64,
    /// Offset inside the caller's buffer
    pub buf_offset: u64,
}

/// Cut `[offset, offset + len)` at extent boundaries.
///
/// Fails with `DataTooLarge` when the range touches more than two extents;
/// nothing is allocated in that case.
pub fn split_request(extent_size: u64, offset: u64, len: u64) -> Result<Vec<ExtentSlice>> {
    if extent_size == 0 {
        return Err(Error::invalid_argument("extent size must be positive"));
    }
    if len == 0 {
        return Err(Error::invalid_argument("zero-length request"));
    }
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Error::invalid_argument("request range overflows"))?;

    let first = offset / extent_size + 1;
    let last = (end - 1) / extent_size + 1;
    if last - first > 1 {
        return Err(Error::DataTooLarge {
            offset,
            length: len,
            extent_size,
        });
    }

    let index = |i: u64| {
        ExtentIndex::try_from(i)
            .map_err(|_| Error::invalid_argument(format!("extent index {i} out of range")))
    };

    if first == last {
        return Ok(vec![ExtentSlice {
            index: index(first)?,
            extent_offset: offset % extent_size,
            len,
            buf_offset: 0,
        }]);
    }

    // Extent `first` ends at `first * extent_size`
    let head = first * extent_size - offset;
    Ok(vec![
        ExtentSlice {
            index: index(first)?,
            extent_offset: offset % extent_size,
            len: head,
            buf_offset: 0,
        },
        ExtentSlice {
            index: index(last)?,
            extent_offset: 0,
            len: len - head,
            buf_offset: head,
        },
    ])
}

/// Delivered to the caller once per logical request
#[derive(Debug)]
pub struct IoCompletion {
    pub kind: IoKind,
    pub offset: u64,
    pub len: u64,
    pub result: Result<()>,
    /// The caller's read buffer. Holds whatever bytes arrived, even on
    /// error; after an integrity error its contents must not be trusted.
    pub buffer: Option<BytesMut>,
    pub latency: Duration,
}

/// Caller completion callback
pub type IoCallback = Box<dyn FnOnce(IoCompletion) + Send + 'static>;

/// Receives every logical request once it has finished, after the
/// caller's callback has run.
pub(crate) trait RequestOwner: Send + Sync {
    fn request_finished(&self, request: &LogicalRequest, result: &Result<()>);
}

/// A caller-issued read or write against the blob address space
pub struct LogicalRequest {
    id: u64,
    kind: IoKind,
    offset: u64,
    len: u64,
    header_checksum: u32,
    split: bool,
    outstanding: AtomicUsize,
    error: OnceLock<Error>,
    parts: Mutex<[Option<BytesMut>; MAX_SLICES]>,
    callback: Mutex<Option<IoCallback>>,
    owner: Arc<dyn RequestOwner>,
    started: Instant,
}

impl LogicalRequest {
    pub(crate) fn new(
        id: u64,
        kind: IoKind,
        offset: u64,
        len: u64,
        slices: usize,
        callback: IoCallback,
        owner: Arc<dyn RequestOwner>,
    ) -> Self {
        debug_assert!((1..=MAX_SLICES).contains(&slices));
        Self {
            id,
            kind,
            offset,
            len,
            header_checksum: header_checksum(len, offset),
            split: slices > 1,
            outstanding: AtomicUsize::new(slices),
            error: OnceLock::new(),
            parts: Mutex::new([None, None]),
            callback: Mutex::new(Some(callback)),
            owner,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> IoKind {
        self.kind
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_split(&self) -> bool {
        self.split
    }

    /// Checksum over `(len, offset)` of the whole request
    pub fn header_checksum(&self) -> u32 {
        self.header_checksum
    }

    /// Physical requests that have not completed yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Record one physical request's outcome; the last one finishes the
    /// logical request.
    fn slot_complete(&self, slot: usize, buf: Option<BytesMut>, status: Result<()>) {
        if let Some(buf) = buf {
            self.parts.lock()[slot] = Some(buf);
        }

        if let Err(e) = status {
            if self.error.set(e.clone()).is_ok() {
                warn!(request = self.id, slot, kind = %self.kind, "sub-request failed: {e}");
            } else {
                debug!(request = self.id, slot, "later sub-request error ignored: {e}");
            }
        }

        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let result = match self.error.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };

        let buffer = {
            let mut parts = self.parts.lock();
            match (parts[0].take(), parts[1].take()) {
                (Some(mut head), Some(tail)) => {
                    head.unsplit(tail);
                    Some(head)
                }
                (head, tail) => head.or(tail),
            }
        };

        let completion = IoCompletion {
            kind: self.kind,
            offset: self.offset,
            len: self.len,
            result: result.clone(),
            buffer,
            latency: self.started.elapsed(),
        };

        debug!(
            request = self.id,
            kind = %self.kind,
            offset = self.offset,
            len = self.len,
            ok = result.is_ok(),
            "request complete"
        );

        if let Some(callback) = self.callback.lock().take() {
            callback(completion);
        }
        self.owner.request_finished(self, &result);
    }
}

impl std::fmt::Debug for LogicalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

enum Payload {
    Read(Mutex<Option<BytesMut>>),
    Write { data: Bytes, checksum: u32 },
}

/// One extent-scoped piece of a logical request
pub struct PhysicalRequest {
    parent: Arc<LogicalRequest>,
    slot: usize,
    extent_id: ExtentId,
    extent_offset: u64,
    len: u64,
    header_checksum: u32,
    payload: Payload,
    completed: AtomicBool,
}

impl PhysicalRequest {
    /// A read filling `buf`, which must be exactly `slice.len` bytes
    pub(crate) fn read(
        parent: Arc<LogicalRequest>,
        slot: usize,
        extent_id: ExtentId,
        slice: &ExtentSlice,
        buf: BytesMut,
    ) -> Self {
        debug_assert_eq!(buf.len() as u64, slice.len);
        Self::new(
            parent,
            slot,
            extent_id,
            slice,
            Payload::Read(Mutex::new(Some(buf))),
        )
    }

    /// A write of `data`, which must be exactly `slice.len` bytes
    pub(crate) fn write(
        parent: Arc<LogicalRequest>,
        slot: usize,
        extent_id: ExtentId,
        slice: &ExtentSlice,
        data: Bytes,
    ) -> Self {
        debug_assert_eq!(data.len() as u64, slice.len);
        let checksum = content_checksum(&data);
        Self::new(
            parent,
            slot,
            extent_id,
            slice,
            Payload::Write { data, checksum },
        )
    }

    fn new(
        parent: Arc<LogicalRequest>,
        slot: usize,
        extent_id: ExtentId,
        slice: &ExtentSlice,
        payload: Payload,
    ) -> Self {
        Self {
            parent,
            slot,
            extent_id,
            extent_offset: slice.extent_offset,
            len: slice.len,
            header_checksum: header_checksum(slice.len, slice.extent_offset),
            payload,
            completed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> IoKind {
        match self.payload {
            Payload::Read(_) => IoKind::Read,
            Payload::Write { .. } => IoKind::Write,
        }
    }

    pub fn extent_id(&self) -> ExtentId {
        self.extent_id
    }

    pub fn extent_offset(&self) -> u64 {
        self.extent_offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn parent(&self) -> &Arc<LogicalRequest> {
        &self.parent
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// The request as it goes on the wire
    pub fn wire_request(&self) -> WireRequest {
        match &self.payload {
            Payload::Read(_) => WireRequest::Read(ReadRequest {
                extent_id: self.extent_id,
                offset: self.extent_offset,
                size: self.len,
                header_checksum: self.header_checksum,
            }),
            Payload::Write { data, checksum } => WireRequest::Write(WriteRequest {
                extent_id: self.extent_id,
                offset: self.extent_offset,
                size: self.len,
                content_checksum: *checksum,
                header_checksum: self.header_checksum,
                payload: data.clone(),
            }),
        }
    }

    /// Claim the completion. Only the first caller gets `true`.
    fn claim(&self) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            debug!(
                request = self.parent.id,
                extent = %self.extent_id,
                "duplicate completion ignored"
            );
            return false;
        }
        true
    }

    fn take_read_buf(&self) -> Option<BytesMut> {
        match &self.payload {
            Payload::Read(buf) => buf.lock().take(),
            Payload::Write { .. } => None,
        }
    }

    /// Complete a read with the transport's answer.
    ///
    /// The payload is copied into the caller's buffer before the remote
    /// status or checksum is looked at.
    pub fn complete_read(&self, response: Result<ReadResponse>) -> bool {
        if !self.claim() {
            return false;
        }
        let mut buf = self.take_read_buf();
        let status = match (response, buf.as_mut()) {
            (Err(e), _) => Err(e),
            (Ok(_), None) => Err(Error::internal("read completion without a buffer")),
            (Ok(resp), Some(buf)) => {
                let n = resp.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&resp.payload[..n]);

                if resp.status != STATUS_OK {
                    Err(Error::Remote { code: resp.status })
                } else if (n as u64) < self.len {
                    Err(Error::ShortRead {
                        expected: self.len,
                        actual: n as u64,
                    })
                } else if let Some(expected) = resp.content_checksum {
                    verify_content(&buf[..], expected).map_err(|actual| {
                        warn!(
                            request = self.parent.id,
                            extent = %self.extent_id,
                            offset = self.extent_offset,
                            expected,
                            actual,
                            "read checksum mismatch"
                        );
                        Error::ChecksumMismatch { expected, actual }
                    })
                } else {
                    Ok(())
                }
            }
        };
        self.parent.slot_complete(self.slot, buf, status);
        true
    }

    /// Complete a write with the transport's answer
    pub fn complete_write(&self, response: Result<WriteResponse>) -> bool {
        if !self.claim() {
            return false;
        }
        let status = response.and_then(|resp| {
            if resp.status == STATUS_OK {
                Ok(())
            } else {
                Err(Error::Remote { code: resp.status })
            }
        });
        self.parent.slot_complete(self.slot, None, status);
        true
    }

    /// Complete without a transport answer (resolution failure, expiry)
    pub fn fail(&self, error: Error) -> bool {
        if !self.claim() {
            return false;
        }
        let buf = self.take_read_buf();
        self.parent.slot_complete(self.slot, buf, Err(error));
        true
    }
}

impl std::fmt::Debug for PhysicalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalRequest")
            .field("request", &self.parent.id)
            .field("slot", &self.slot)
            .field("extent", &self.extent_id)
            .field("offset", &self.extent_offset)
            .field("len", &self.len)
            .field("completed", &self.is_completed())
            .finish()
    }
}
