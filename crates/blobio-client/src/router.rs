//! Extent routing
//!
//! The metadata service decides which node serves an extent. The client
//! consumes that decision through [`Router`]; [`StaticRouter`] is a fixed
//! table for tools, tests and single-node setups.

use blobio_common::{BlobId, Error, ExtentId, Result, RouteEntry};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Resolves an extent to the nodes serving it
pub trait Router: Send + Sync {
    /// Fails with `RouterNotFound` when the extent is unknown and with
    /// `RaftGroupNotFound` when it is known but no group serves it.
    fn query_router(&self, extent_id: ExtentId) -> Result<RouteEntry>;
}

#[derive(Clone, Debug)]
enum Route {
    Serving(RouteEntry),
    NoGroup,
}

/// Routing table held in memory
#[derive(Debug, Default)]
pub struct StaticRouter {
    extents: RwLock<HashMap<ExtentId, Route>>,
    blobs: RwLock<HashMap<BlobId, RouteEntry>>,
}

impl StaticRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one extent
    pub fn set_route(&self, extent_id: ExtentId, entry: RouteEntry) {
        self.extents.write().insert(extent_id, Route::Serving(entry));
    }

    /// Route every extent of a blob that has no explicit entry
    pub fn set_blob_route(&self, blob_id: BlobId, entry: RouteEntry) {
        self.blobs.write().insert(blob_id, entry);
    }

    /// Mark an extent as known but not served by any group
    pub fn set_no_group(&self, extent_id: ExtentId) {
        self.extents.write().insert(extent_id, Route::NoGroup);
    }

    pub fn remove_route(&self, extent_id: ExtentId) {
        self.extents.write().remove(&extent_id);
    }
}

impl Router for StaticRouter {
    fn query_router(&self, extent_id: ExtentId) -> Result<RouteEntry> {
        match self.extents.read().get(&extent_id) {
            Some(Route::Serving(entry)) => return Ok(entry.clone()),
            Some(Route::NoGroup) => return Err(Error::RaftGroupNotFound(extent_id)),
            None => {}
        }
        self.blobs
            .read()
            .get(&extent_id.blob_id)
            .cloned()
            .ok_or(Error::RouterNotFound(extent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobio_common::{NodeAddr, NodeId};

    fn entry(node: u64) -> RouteEntry {
        RouteEntry::primary_only(NodeAddr::new(NodeId::new(node), "127.0.0.1", 7000))
    }

    #[test]
    fn test_extent_route_overrides_blob_route() {
        let router = StaticRouter::new();
        let blob = BlobId::new(9);
        router.set_blob_route(blob, entry(1));
        router.set_route(ExtentId::new(blob, 2), entry(2));

        assert_eq!(
            router.query_router(ExtentId::new(blob, 1)).unwrap().primary.node_id,
            NodeId::new(1)
        );
        assert_eq!(
            router.query_router(ExtentId::new(blob, 2)).unwrap().primary.node_id,
            NodeId::new(2)
        );
    }

    #[test]
    fn test_resolution_failures() {
        let router = StaticRouter::new();
        let extent = ExtentId::new(BlobId::new(1), 1);
        assert_eq!(
            router.query_router(extent),
            Err(Error::RouterNotFound(extent))
        );

        router.set_no_group(extent);
        assert_eq!(
            router.query_router(extent),
            Err(Error::RaftGroupNotFound(extent))
        );

        router.remove_route(extent);
        assert!(router.query_router(extent).is_err());
    }
}
