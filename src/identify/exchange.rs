//! The identify handshake and its raw result.

use std::{fmt, str::FromStr};

use libp2p::{identify, Multiaddr, PeerId};
use num_bigint::BigUint;
use tokio::time::Instant;

use crate::{
    error::IdentifyError,
    peer::{connect::Connection, node::NetworkNode},
};

/// Suffix marking a decimal string as an arbitrary-precision integer.
pub const BIG_INTEGER_MARKER: char = 'n';

/// Per-peer record counter. Unbounded, so replaying it never overflows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(BigUint);

impl SequenceNumber {
    pub fn new(value: BigUint) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &BigUint {
        &self.0
    }

    /// Decimal rendering with the big-integer marker, e.g. `42n`.
    pub fn to_tagged_string(&self) -> String {
        format!("{}{BIG_INTEGER_MARKER}", self.0)
    }

    /// Inverse of [`SequenceNumber::to_tagged_string`]. The marker is optional.
    pub fn parse_tagged(value: &str) -> Option<Self> {
        let digits = value.strip_suffix(BIG_INTEGER_MARKER).unwrap_or(value);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        BigUint::from_str(digits).ok().map(Self)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Addresses a peer attested to with its own signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPeerRecord {
    pub seq: SequenceNumber,
    pub addresses: Vec<Multiaddr>,
}

/// What a remote peer told us about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub peer_id: PeerId,
    pub agent_version: String,
    pub protocol_version: String,
    /// Our address as the remote saw it.
    pub observed_addr: Multiaddr,
    /// Protobuf-encoded public key, when the peer sent one.
    pub public_key: Option<Vec<u8>>,
    pub listen_addrs: Vec<Multiaddr>,
    pub protocols: Vec<String>,
    pub signed_peer_record: Option<SignedPeerRecord>,
}

impl IdentifyResponse {
    /// Converts the info received by the libp2p identify behaviour.
    pub fn from_info(peer_id: PeerId, info: &identify::Info) -> Self {
        Self {
            peer_id,
            agent_version: info.agent_version.clone(),
            protocol_version: info.protocol_version.clone(),
            observed_addr: info.observed_addr.clone(),
            public_key: Some(info.public_key.encode_protobuf()),
            listen_addrs: info.listen_addrs.clone(),
            protocols: info.protocols.iter().map(ToString::to_string).collect(),
            // libp2p-identify does not hand out the signed envelope yet.
            signed_peer_record: None,
        }
    }
}

/// Runs identify over a connection under a deadline.
pub struct IdentifyExchanger<'a, N: ?Sized> {
    node: &'a N,
}

impl<'a, N: NetworkNode + ?Sized> IdentifyExchanger<'a, N> {
    pub fn new(node: &'a N) -> Self {
        Self { node }
    }

    /// Waits for the identify response on `connection`.
    ///
    /// A response claiming a different peer than the one we authenticated is
    /// treated as malformed.
    pub async fn identify(
        &self,
        connection: &Connection,
        deadline: Instant,
    ) -> Result<IdentifyResponse, IdentifyError> {
        let peer = connection.peer_id.to_string();

        let response = match tokio::time::timeout_at(deadline, self.node.identify(connection)).await
        {
            Err(_) => {
                tracing::warn!(target: "identify", %peer, "identify hit the deadline");
                return Err(IdentifyError::HandshakeTimeout { peer });
            }
            Ok(Err(err)) => {
                tracing::warn!(target: "identify", %peer, err = %format!("{err:#}"), "identify failed");
                return Err(IdentifyError::HandshakeFailed {
                    peer,
                    reason: format!("{err:#}"),
                });
            }
            Ok(Ok(response)) => response,
        };

        if response.peer_id != connection.peer_id {
            return Err(IdentifyError::HandshakeFailed {
                peer,
                reason: format!("response describes a different peer ({})", response.peer_id),
            });
        }

        tracing::info!(
            target: "identify",
            %peer,
            agent = %response.agent_version,
            protocols = response.protocols.len(),
            listen_addrs = response.listen_addrs.len(),
            "identify response received",
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_round_trip_through_the_marker() {
        let seq = SequenceNumber::from(42);
        assert_eq!(seq.to_tagged_string(), "42n");
        assert_eq!(SequenceNumber::parse_tagged("42n"), Some(seq.clone()));
        assert_eq!(SequenceNumber::parse_tagged("42"), Some(seq));
    }

    #[test]
    fn sequence_numbers_exceed_fixed_width() {
        let huge = "340282366920938463463374607431768211457";
        let seq = SequenceNumber::parse_tagged(&format!("{huge}n")).unwrap();
        assert_eq!(seq.to_string(), huge);
        assert!(SequenceNumber::parse_tagged("n").is_none());
        assert!(SequenceNumber::parse_tagged("-1n").is_none());
        assert!(SequenceNumber::parse_tagged("0x10n").is_none());
    }
}
