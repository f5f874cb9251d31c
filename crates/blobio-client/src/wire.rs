//! Extent wire operations
//!
//! The storage node implements these; the client only builds requests and
//! interprets responses. A channel error means the RPC itself failed; a
//! non-zero `status` in a response is the remote node's verdict.

use async_trait::async_trait;
use blobio_common::{ExtentId, Result, header_checksum};
use bytes::Bytes;

/// Remote status meaning success
pub const STATUS_OK: i32 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub extent_id: ExtentId,
    pub offset: u64,
    pub size: u64,
    pub header_checksum: u32,
}

impl ReadRequest {
    #[must_use]
    pub fn new(extent_id: ExtentId, offset: u64, size: u64) -> Self {
        Self {
            extent_id,
            offset,
            size,
            header_checksum: header_checksum(size, offset),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadResponse {
    pub status: i32,
    pub payload: Bytes,
    /// Present when the node vouches for the payload
    pub content_checksum: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    pub extent_id: ExtentId,
    pub offset: u64,
    pub size: u64,
    pub content_checksum: u32,
    pub header_checksum: u32,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResponse {
    pub status: i32,
}

/// A connection to one storage node
#[async_trait]
pub trait ExtentChannel: Send + Sync {
    async fn read(&self, request: ReadRequest) -> Result<ReadResponse>;

    async fn write(&self, request: WriteRequest) -> Result<WriteResponse>;
}

/// An extent request ready to go on the wire
#[derive(Clone, Debug)]
pub enum WireRequest {
    Read(ReadRequest),
    Write(WriteRequest),
}

impl WireRequest {
    #[must_use]
    pub const fn extent_id(&self) -> ExtentId {
        match self {
            Self::Read(r) => r.extent_id,
            Self::Write(w) => w.extent_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobio_common::BlobId;

    #[test]
    fn test_read_request_header_checksum() {
        let extent = ExtentId::new(BlobId::new(1), 2);
        let req = ReadRequest::new(extent, 4096, 512);
        assert_eq!(req.header_checksum, header_checksum(512, 4096));
        assert_eq!(WireRequest::Read(req).extent_id(), extent);
    }
}
