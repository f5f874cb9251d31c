//! Storage node connection pool
//!
//! Channels are cached per node id. Two node ids that resolve to the same
//! `ip:port` share one channel. The pool is not reentrant: its methods take
//! `&mut self`, and the shared handle wraps it in a mutex.

use crate::wire::ExtentChannel;
use blobio_common::{NodeAddr, NodeId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection cache consumed by the data path
pub trait ConnectionPool: Send {
    /// Cached channel for `node_id`, if any
    fn get_connection(&mut self, node_id: NodeId) -> Option<Arc<dyn ExtentChannel>>;

    /// Open (or alias) a channel to `node_id` at `ip:port` and cache it
    fn new_connection(
        &mut self,
        node_id: NodeId,
        ip: &str,
        port: u16,
    ) -> Result<Arc<dyn ExtentChannel>>;
}

/// Connection pool shared by every stream of a client
pub type SharedConnectionPool = Arc<Mutex<dyn ConnectionPool>>;

/// Wrap a pool for sharing
pub fn shared_pool<P: ConnectionPool + 'static>(pool: P) -> SharedConnectionPool {
    Arc::new(Mutex::new(pool))
}

/// Cached channel for `addr`, opening one if needed
pub fn get_or_connect(pool: &SharedConnectionPool, addr: &NodeAddr) -> Result<Arc<dyn ExtentChannel>> {
    let mut pool = pool.lock();
    if let Some(channel) = pool.get_connection(addr.node_id) {
        return Ok(channel);
    }
    pool.new_connection(addr.node_id, &addr.ip, addr.port)
}

/// Opens channels to storage nodes
pub trait Connector: Send {
    fn connect(&self, addr: &NodeAddr) -> Result<Arc<dyn ExtentChannel>>;
}

/// Channel cache keyed by node id, aliasing nodes that share an endpoint
pub struct NodeConnectionPool<C> {
    connector: C,
    nodes: HashMap<NodeId, Arc<dyn ExtentChannel>>,
    endpoints: HashMap<String, NodeId>,
}

impl<C: Connector> NodeConnectionPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            nodes: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }

    /// Number of node ids with a cached channel
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop the channel cached for `node_id`
    pub fn evict(&mut self, node_id: NodeId) -> bool {
        self.endpoints.retain(|_, id| *id != node_id);
        self.nodes.remove(&node_id).is_some()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }
}

impl<C: Connector> ConnectionPool for NodeConnectionPool<C> {
    fn get_connection(&mut self, node_id: NodeId) -> Option<Arc<dyn ExtentChannel>> {
        self.nodes.get(&node_id).cloned()
    }

    fn new_connection(
        &mut self,
        node_id: NodeId,
        ip: &str,
        port: u16,
    ) -> Result<Arc<dyn ExtentChannel>> {
        if let Some(channel) = self.nodes.get(&node_id) {
            return Ok(Arc::clone(channel));
        }

        let addr = NodeAddr::new(node_id, ip, port);
        let endpoint = addr.endpoint();

        if let Some(existing) = self.endpoints.get(&endpoint)
            && let Some(channel) = self.nodes.get(existing).cloned()
        {
            debug!(%node_id, alias_of = %existing, %endpoint, "reusing channel");
            self.nodes.insert(node_id, Arc::clone(&channel));
            return Ok(channel);
        }

        let channel = self.connector.connect(&addr)?;
        self.nodes.insert(node_id, Arc::clone(&channel));
        self.endpoints.insert(endpoint.clone(), node_id);

        info!(%node_id, %endpoint, "connected to storage node");
        Ok(channel)
    }
}

impl<C> std::fmt::Debug for NodeConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("nodes", &self.nodes.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}
