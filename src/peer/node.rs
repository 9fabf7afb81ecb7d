//! The local node as seen by the identify workflow.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};

use crate::{
    identify::IdentifyResponse,
    peer::{
        connect::Connection,
        discovery::{DhtQueryError, ProgressSender},
    },
};

/// Operations the workflow needs from a running libp2p node.
///
/// Every component receives the node explicitly, so several independent
/// nodes (or test doubles) can coexist in one process.
#[async_trait]
pub trait NetworkNode: Send + Sync {
    /// Identity of the local node, for status output.
    fn local_peer_id(&self) -> PeerId;

    /// Looks `peer_id` up in the DHT, reporting progress on `progress`.
    async fn find_peer(
        &self,
        peer_id: PeerId,
        progress: ProgressSender,
    ) -> std::result::Result<Vec<Multiaddr>, DhtQueryError>;

    /// Opens a connection using any of `addresses`.
    async fn dial(&self, addresses: Vec<Multiaddr>) -> Result<Connection>;

    /// Runs the identify protocol over an established connection.
    async fn identify(&self, connection: &Connection) -> Result<IdentifyResponse>;

    /// Number of peers we currently hold at least one connection to.
    async fn active_connection_count(&self) -> Result<usize>;
}

#[async_trait]
impl<T: NetworkNode + ?Sized> NetworkNode for Arc<T> {
    fn local_peer_id(&self) -> PeerId {
        (**self).local_peer_id()
    }

    async fn find_peer(
        &self,
        peer_id: PeerId,
        progress: ProgressSender,
    ) -> std::result::Result<Vec<Multiaddr>, DhtQueryError> {
        (**self).find_peer(peer_id, progress).await
    }

    async fn dial(&self, addresses: Vec<Multiaddr>) -> Result<Connection> {
        (**self).dial(addresses).await
    }

    async fn identify(&self, connection: &Connection) -> Result<IdentifyResponse> {
        (**self).identify(connection).await
    }

    async fn active_connection_count(&self) -> Result<usize> {
        (**self).active_connection_count().await
    }
}
