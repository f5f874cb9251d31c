//! Client façade
//!
//! Owns what every open blob shares: the router, the connection pool, the
//! dispatch pool and the runtime driving the live transport.

use crate::blob::{BlobStream, BlobStreamOptions};
use crate::connection::SharedConnectionPool;
use crate::dispatch::DispatchPool;
use crate::router::Router;
use crate::stats::DispatchStats;
use crate::transport::TransportKind;
use blobio_common::{BlobId, ClientConfig, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// What the metadata service knows about a blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub blob_id: BlobId,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub pool_id: u32,
    #[serde(default)]
    pub user_id: u32,
}

pub struct BlobClient {
    config: ClientConfig,
    router: Arc<dyn Router>,
    connections: SharedConnectionPool,
    dispatcher: Arc<DispatchPool>,
    runtime: Handle,
}

impl BlobClient {
    /// Validate `config` and start the dispatch pool
    pub fn new(
        config: ClientConfig,
        router: Arc<dyn Router>,
        connections: SharedConnectionPool,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(DispatchPool::new(config.dispatch.clone())?);
        Ok(Self {
            config,
            router,
            connections,
            dispatcher,
            runtime,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a blob issuing through the live transport
    pub fn open(&self, descriptor: BlobDescriptor) -> Result<BlobStream> {
        self.open_with(descriptor, TransportKind::Live)
    }

    pub fn open_with(
        &self,
        descriptor: BlobDescriptor,
        transport: TransportKind,
    ) -> Result<BlobStream> {
        BlobStream::open(BlobStreamOptions {
            blob_id: descriptor.blob_id,
            name: descriptor.name,
            size: descriptor.size,
            pool_id: descriptor.pool_id,
            user_id: descriptor.user_id,
            stream: self.config.stream.clone(),
            router: Arc::clone(&self.router),
            connections: Arc::clone(&self.connections),
            dispatcher: Some(Arc::clone(&self.dispatcher)),
            runtime: Some(self.runtime.clone()),
            transport,
        })
    }

    pub fn dispatcher(&self) -> &Arc<DispatchPool> {
        &self.dispatcher
    }

    pub fn dispatch_stats(&self) -> Arc<DispatchStats> {
        self.dispatcher.stats()
    }

    /// Stop the dispatch pool. Requests still queued complete as closed.
    pub fn shutdown(&self) {
        info!("shutting down blob client");
        self.dispatcher.stop();
    }
}

impl std::fmt::Debug for BlobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobClient")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{NodeConnectionPool, shared_pool};
    use crate::router::StaticRouter;
    use crate::testing::{CountingConnector, MemoryCluster};
    use blobio_common::{DispatchConfig, Error, NodeAddr, NodeId, RouteEntry};

    fn client(runtime: &tokio::runtime::Runtime) -> BlobClient {
        let cluster = MemoryCluster::new();
        let addr = NodeAddr::new(NodeId::new(1), "127.0.0.1", 7000);
        cluster.add_node(addr.clone());
        let router = Arc::new(StaticRouter::new());
        router.set_blob_route(BlobId::new(1), RouteEntry::primary_only(addr));

        let mut config = ClientConfig::default();
        config.dispatch = DispatchConfig {
            workers: 2,
            ..DispatchConfig::default()
        };
        BlobClient::new(
            config,
            router,
            shared_pool(NodeConnectionPool::new(CountingConnector::new(cluster))),
            runtime.handle().clone(),
        )
        .unwrap()
    }

    fn descriptor() -> BlobDescriptor {
        BlobDescriptor {
            blob_id: BlobId::new(1),
            name: "disk0".to_string(),
            size: 1 << 30,
            pool_id: 0,
            user_id: 0,
        }
    }

    #[test]
    fn test_open_write_read() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = client(&runtime);
        let blob = client.open(descriptor()).unwrap();

        blob.write(b"hello blob", 1 << 20).unwrap();
        let mut buf = [0u8; 10];
        blob.read(&mut buf, 1 << 20).unwrap();
        assert_eq!(&buf, b"hello blob");
        assert_eq!(blob.extent_size(), client.config().stream.extent_size);
    }

    #[test]
    fn test_shutdown_expires_new_requests() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = client(&runtime);
        let blob = client.open(descriptor()).unwrap();
        client.shutdown();

        let (tx, rx) = crossbeam_channel::bounded(1);
        blob.async_write(bytes::Bytes::from_static(b"x"), 0, move |c| {
            let _ = tx.send(c.result);
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap(), Err(Error::DeviceClosed));
        assert_eq!(client.dispatch_stats().expired(), 1);
    }

    #[test]
    fn test_descriptor_from_metadata_json() {
        let json = r#"{"blob_id": 42, "name": "vol-a", "size": 134217728}"#;
        let descriptor: BlobDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.blob_id, BlobId::new(42));
        assert_eq!(descriptor.size, 128 << 20);
        assert_eq!(descriptor.pool_id, 0);
        assert_eq!(descriptor.user_id, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut config = ClientConfig::default();
        config.dispatch.workers = 3;
        let result = BlobClient::new(
            config,
            Arc::new(StaticRouter::new()),
            shared_pool(NodeConnectionPool::new(CountingConnector::new(
                MemoryCluster::new(),
            ))),
            runtime.handle().clone(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
