//! In-memory storage nodes for tests and smoke runs
//!
//! [`MemoryNode`] implements the extent wire operations against a map of
//! byte vectors and can be told to misbehave. Delays use `tokio::time`, so
//! the runtime driving the live transport needs its timer enabled.

use crate::connection::Connector;
use crate::wire::{
    ExtentChannel, ReadRequest, ReadResponse, STATUS_OK, WriteRequest, WriteResponse,
};
use async_trait::async_trait;
use blobio_common::{
    Error, ExtentId, NodeAddr, NodeId, Result, content_checksum, header_checksum,
    verify_content,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Status returned when a request's header checksum does not match
pub const STATUS_BAD_HEADER: i32 = 22;
/// Status returned when a write's payload does not match its checksum
pub const STATUS_BAD_CHECKSUM: i32 = 23;

/// Misbehaviour injected into a [`MemoryNode`]
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Fail the RPC itself
    pub fail_rpc: bool,
    /// Answer with this non-zero status
    pub remote_status: Option<i32>,
    /// Report a wrong checksum on reads
    pub corrupt_checksum: bool,
    /// Report no checksum on reads
    pub omit_checksum: bool,
    /// Hold every answer this long
    pub delay: Option<Duration>,
}

/// A storage node backed by memory
#[derive(Debug)]
pub struct MemoryNode {
    addr: NodeAddr,
    extents: Mutex<HashMap<ExtentId, Vec<u8>>>,
    faults: Mutex<Faults>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryNode {
    pub fn new(addr: NodeAddr) -> Self {
        Self {
            addr,
            extents: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    pub fn clear_faults(&self) {
        self.set_faults(Faults::default());
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Bytes stored for an extent at `[offset, offset + len)`, zero-filled
    pub fn extent_bytes(&self, extent_id: ExtentId, offset: u64, len: u64) -> Vec<u8> {
        let extents = self.extents.lock();
        let mut out = vec![0u8; len as usize];
        if let Some(data) = extents.get(&extent_id) {
            let start = (offset as usize).min(data.len());
            let end = ((offset + len) as usize).min(data.len());
            out[..end - start].copy_from_slice(&data[start..end]);
        }
        out
    }

    async fn apply_faults(&self) -> Result<Option<i32>> {
        let faults = self.faults.lock().clone();
        if let Some(delay) = faults.delay {
            tokio::time::sleep(delay).await;
        }
        if faults.fail_rpc {
            return Err(Error::RpcFailed(format!(
                "injected failure on {}",
                self.addr.node_id
            )));
        }
        Ok(faults.remote_status)
    }
}

#[async_trait]
impl ExtentChannel for MemoryNode {
    async fn read(&self, request: ReadRequest) -> Result<ReadResponse> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(status) = self.apply_faults().await? {
            return Ok(ReadResponse {
                status,
                payload: Bytes::new(),
                content_checksum: None,
            });
        }
        if request.header_checksum != header_checksum(request.size, request.offset) {
            return Ok(ReadResponse {
                status: STATUS_BAD_HEADER,
                payload: Bytes::new(),
                content_checksum: None,
            });
        }

        let payload = self.extent_bytes(request.extent_id, request.offset, request.size);
        let faults = self.faults.lock().clone();
        let checksum = if faults.omit_checksum {
            None
        } else if faults.corrupt_checksum {
            Some(!content_checksum(&payload))
        } else {
            Some(content_checksum(&payload))
        };
        Ok(ReadResponse {
            status: STATUS_OK,
            payload: Bytes::from(payload),
            content_checksum: checksum,
        })
    }

    async fn write(&self, request: WriteRequest) -> Result<WriteResponse> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(status) = self.apply_faults().await? {
            return Ok(WriteResponse { status });
        }
        if request.header_checksum != header_checksum(request.size, request.offset) {
            return Ok(WriteResponse {
                status: STATUS_BAD_HEADER,
            });
        }
        if request.payload.len() as u64 != request.size
            || verify_content(&request.payload, request.content_checksum).is_err()
        {
            return Ok(WriteResponse {
                status: STATUS_BAD_CHECKSUM,
            });
        }

        let mut extents = self.extents.lock();
        let data = extents.entry(request.extent_id).or_default();
        let start = request.offset as usize;
        let end = start + request.payload.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(&request.payload);
        Ok(WriteResponse { status: STATUS_OK })
    }
}

/// A set of in-memory nodes addressed by node id
#[derive(Clone, Debug, Default)]
pub struct MemoryCluster {
    nodes: Arc<RwLock<HashMap<NodeId, Arc<MemoryNode>>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, addr: NodeAddr) -> Arc<MemoryNode> {
        let node = Arc::new(MemoryNode::new(addr.clone()));
        self.nodes.write().insert(addr.node_id, Arc::clone(&node));
        node
    }

    pub fn node(&self, node_id: NodeId) -> Option<Arc<MemoryNode>> {
        self.nodes.read().get(&node_id).cloned()
    }

    pub fn remove_node(&self, node_id: NodeId) -> Option<Arc<MemoryNode>> {
        self.nodes.write().remove(&node_id)
    }
}

/// Connects to a [`MemoryCluster`] and counts how often it had to
#[derive(Debug)]
pub struct CountingConnector {
    cluster: MemoryCluster,
    connects: AtomicU64,
}

impl CountingConnector {
    pub fn new(cluster: MemoryCluster) -> Self {
        Self {
            cluster,
            connects: AtomicU64::new(0),
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

impl Connector for CountingConnector {
    fn connect(&self, addr: &NodeAddr) -> Result<Arc<dyn ExtentChannel>> {
        let node = self.cluster.node(addr.node_id).ok_or_else(|| {
            Error::RpcFailed(format!("connection refused by {}", addr.endpoint()))
        })?;
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(node as Arc<dyn ExtentChannel>)
    }
}
