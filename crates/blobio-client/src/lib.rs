//! BlobIO Client - client-side data path for blob I/O
//!
//! A blob is a fixed-size block device cut into equal extents, each served
//! by a primary storage node. This crate turns reads and writes against a
//! blob into extent requests, moves them off the caller's thread, and joins
//! the answers into exactly one completion per call.
//!
//! ```text
//! BlobStream ──split──► ExtentStream ──push──► DispatchPool ──issue──► transport
//!     ▲                                                                  │
//!     └──────────────── completion (runtime thread) ◄────────────────────┘
//! ```
//!
//! - [`BlobStream`]: validates, splits at extent boundaries, joins completions
//! - [`ExtentStream`]: routes an extent to its primary node and picks a transport
//! - [`DispatchPool`]: worker threads keyed by extent, bounded rings, backpressure
//! - [`RangeScheduler`]: keeps overlapping byte ranges from running together

pub mod blob;
pub mod client;
pub mod connection;
pub mod dispatch;
pub mod metrics;
pub mod protocol;
pub mod request;
pub mod router;
pub mod scheduler;
pub mod stats;
pub mod transport;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use blob::{BlobStream, BlobStreamOptions};
pub use client::{BlobClient, BlobDescriptor};
pub use connection::{
    ConnectionPool, Connector, NodeConnectionPool, SharedConnectionPool, shared_pool,
};
pub use dispatch::{DispatchItem, DispatchPool};
pub use metrics::PrometheusExporter;
pub use protocol::{ExtentStream, IssueMode};
pub use request::{ExtentSlice, IoCallback, IoCompletion, split_request};
pub use router::{Router, StaticRouter};
pub use scheduler::{Admission, IoRange, RangeScheduler};
pub use stats::{DispatchStats, IoStats, LatencyHistogram, LatencyPercentiles};
pub use transport::{ExtentTransport, LiveTransport, NullTransport, TransportKind};
pub use wire::{ExtentChannel, ReadRequest, ReadResponse, WriteRequest, WriteResponse};
