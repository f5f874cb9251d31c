//! Core type definitions for BlobIO
//!
//! Identifiers for blobs, extents and storage nodes, plus the routing
//! entries the metadata service hands back for an extent.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a blob (a logical block device)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("blob-{_0}")]
pub struct BlobId(u64);

impl BlobId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// 1-based position of an extent inside its blob.
///
/// Byte offset `o` of a blob with extent size `e` lives in extent `o / e + 1`.
pub type ExtentIndex = u32;

/// Identifies one extent of one blob; the unit the router resolves.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtentId {
    pub blob_id: BlobId,
    pub index: ExtentIndex,
}

impl ExtentId {
    #[must_use]
    pub const fn new(blob_id: BlobId, index: ExtentIndex) -> Self {
        Self { blob_id, index }
    }

    /// Packed wire form: blob id in the high 32 bits, extent index in the low 32.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        (self.blob_id.as_u64() << 32) | self.index as u64
    }
}

impl fmt::Debug for ExtentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtentId({}:{})", self.blob_id.as_u64(), self.index)
    }
}

impl fmt::Display for ExtentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/extent-{}", self.blob_id, self.index)
    }
}

/// Storage node identifier as assigned by the metadata service
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("node-{_0}")]
pub struct NodeId(u64);

impl NodeId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Where a storage node can be reached
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(node_id: NodeId, ip: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            ip: ip.into(),
            port,
        }
    }

    /// `ip:port`, used to detect two node ids sharing one endpoint
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Routing answer for one extent: the node serving I/O plus its replicas
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub primary: NodeAddr,
    #[serde(default)]
    pub secondaries: Vec<NodeAddr>,
}

impl RouteEntry {
    #[must_use]
    pub fn primary_only(primary: NodeAddr) -> Self {
        Self {
            primary,
            secondaries: Vec::new(),
        }
    }
}

/// Direction of an I/O request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoKind {
    Read,
    Write,
}

impl IoKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
