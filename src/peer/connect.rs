//! Opening a connection to resolved candidate addresses.

use libp2p::{swarm::ConnectionId, Multiaddr, PeerId};
use tokio::time::Instant;

use crate::{
    error::IdentifyError,
    peer::{discovery::CandidateAddressSet, node::NetworkNode},
};

/// An established connection to a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Peer authenticated during the connection handshake.
    pub peer_id: PeerId,
    /// Swarm-assigned id, used to match identify responses to this connection.
    pub connection_id: ConnectionId,
    /// Address the connection was actually made to.
    pub remote_address: Multiaddr,
}

/// Dials a [`CandidateAddressSet`] under a deadline.
pub struct ConnectionEstablisher<'a, N: ?Sized> {
    node: &'a N,
}

impl<'a, N: NetworkNode + ?Sized> ConnectionEstablisher<'a, N> {
    pub fn new(node: &'a N) -> Self {
        Self { node }
    }

    /// Returns the first connection the node manages to open.
    ///
    /// The order and parallelism of individual attempts is left to the node.
    pub async fn connect(
        &self,
        candidates: &CandidateAddressSet,
        deadline: Instant,
    ) -> Result<Connection, IdentifyError> {
        let target = candidates.describe();
        tracing::info!(target: "peer", %target, candidates = candidates.len(), "connecting");

        match tokio::time::timeout_at(deadline, self.node.dial(candidates.as_slice().to_vec())).await
        {
            Err(_) => {
                tracing::warn!(target: "peer", %target, "dial hit the deadline");
                Err(IdentifyError::DialTimeout { target })
            }
            Ok(Err(err)) => {
                tracing::warn!(target: "peer", %target, err = %format!("{err:#}"), "dial failed");
                Err(IdentifyError::DialFailed {
                    target,
                    reason: format!("{err:#}"),
                })
            }
            Ok(Ok(connection)) => {
                tracing::info!(
                    target: "peer",
                    peer_id = %connection.peer_id,
                    address = %connection.remote_address,
                    "connection established",
                );
                Ok(connection)
            }
        }
    }
}
