//! DHT-backed address resolution and the progress events it reports.

use std::{collections::HashSet, fmt};

use libp2p::{core::Multiaddr, multiaddr::Protocol, PeerId};
use tokio::{sync::mpsc, time::Instant};

use crate::{error::IdentifyError, peer::node::NetworkNode, peer::reference::PeerReference};

/// Name of the Kademlia request a peer lookup sends.
pub const FIND_NODE_QUERY: &str = "FIND_NODE";

/// Sink handed to [`NetworkNode::find_peer`] for lookup progress.
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Observable steps of a DHT lookup. Purely informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The lookup is dialing a peer to ask it about the target.
    DialingPeer { peer: PeerId },
    /// A query message is being sent to `to`.
    SendingQuery { to: PeerId, query: String },
    /// Asking `from` failed; the lookup carries on with other peers.
    QueryError {
        from: PeerId,
        code: String,
        message: String,
    },
    /// Any other lookup activity, identified by name only.
    Other { name: String },
}

impl ProgressEvent {
    pub fn name(&self) -> &str {
        match self {
            ProgressEvent::DialingPeer { .. } => "kad-dht:query:dial-peer",
            ProgressEvent::SendingQuery { .. } => "kad-dht:query:send-query",
            ProgressEvent::QueryError { .. } => "kad-dht:query:query-error",
            ProgressEvent::Other { name } => name,
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::DialingPeer { peer } => write!(f, "{} {peer}", self.name()),
            ProgressEvent::SendingQuery { to, query } => {
                write!(f, "{} To: {to} Query: {query}", self.name())
            }
            ProgressEvent::QueryError {
                from,
                code,
                message,
            } => write!(f, "{} To: {from} {code} {message}", self.name()),
            ProgressEvent::Other { name } => f.write_str(name),
        }
    }
}

/// Failures reported by a DHT peer lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtQueryError {
    NotFound,
    Timeout,
    Internal(String),
}

/// Non-empty, ordered list of addresses to dial for one identify run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAddressSet {
    addresses: Vec<Multiaddr>,
}

impl CandidateAddressSet {
    /// A set holding exactly the address the caller gave us.
    pub fn single(address: Multiaddr) -> Self {
        Self {
            addresses: vec![address],
        }
    }

    /// Makes every address dialable on its own by ending it in `/p2p/<peer_id>`.
    ///
    /// Addresses that already end in a different peer id are dropped, as are
    /// duplicates. Returns `None` when nothing usable is left.
    pub fn for_peer(peer_id: &PeerId, addresses: impl IntoIterator<Item = Multiaddr>) -> Option<Self> {
        let mut unique = HashSet::new();
        let addresses: Vec<Multiaddr> = addresses
            .into_iter()
            .filter_map(|address| with_peer_id(address, peer_id))
            .filter(|address| unique.insert(address.clone()))
            .collect();

        (!addresses.is_empty()).then_some(Self { addresses })
    }

    pub fn as_slice(&self) -> &[Multiaddr] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// The peer id every candidate ends in, if they agree on one.
    pub fn peer_id(&self) -> Option<PeerId> {
        let mut ids = self.addresses.iter().map(trailing_peer_id);
        let first = ids.next()??;
        ids.all(|id| id == Some(first)).then_some(first)
    }

    /// Short human description, used in dial errors.
    pub fn describe(&self) -> String {
        match (self.addresses.as_slice(), self.peer_id()) {
            ([single], _) => single.to_string(),
            (_, Some(peer_id)) => format!("{peer_id} ({} addresses)", self.addresses.len()),
            (all, None) => all
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl IntoIterator for CandidateAddressSet {
    type Item = Multiaddr;
    type IntoIter = std::vec::IntoIter<Multiaddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.addresses.into_iter()
    }
}

/// Returns the peer id in the final `/p2p` component of `address`.
pub fn trailing_peer_id(address: &Multiaddr) -> Option<PeerId> {
    match address.iter().last() {
        Some(Protocol::P2p(peer_id)) => Some(peer_id),
        _ => None,
    }
}

fn with_peer_id(mut address: Multiaddr, peer_id: &PeerId) -> Option<Multiaddr> {
    match trailing_peer_id(&address) {
        Some(existing) if existing == *peer_id => Some(address),
        Some(existing) => {
            tracing::debug!(
                target: "peer",
                %peer_id,
                %address,
                %existing,
                "dropping lookup address with mismatched trailing peer id",
            );
            None
        }
        None if address.is_empty() => None,
        None => {
            address.push(Protocol::P2p(*peer_id));
            Some(address)
        }
    }
}

/// Turns a [`PeerReference`] into addresses that can be dialed.
pub struct AddressResolver<'a, N: ?Sized> {
    node: &'a N,
}

impl<'a, N: NetworkNode + ?Sized> AddressResolver<'a, N> {
    pub fn new(node: &'a N) -> Self {
        Self { node }
    }

    /// Resolves `reference` before `deadline`.
    ///
    /// Addresses are returned as-is without touching the DHT. Peer ids are
    /// looked up through the node, and every lookup event is handed to
    /// `on_progress` in the order it was received.
    pub async fn resolve(
        &self,
        reference: &PeerReference,
        deadline: Instant,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<CandidateAddressSet, IdentifyError> {
        let peer_id = match reference {
            PeerReference::Address(address) => {
                return Ok(CandidateAddressSet::single(address.clone()))
            }
            PeerReference::OpaqueIdentity(peer_id) => *peer_id,
        };

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let lookup = self.node.find_peer(peer_id, progress_tx);
        tokio::pin!(lookup);
        let deadline_elapsed = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline_elapsed);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = progress_rx.recv() => on_progress(event),
                result = &mut lookup => break Some(result),
                _ = &mut deadline_elapsed => break None,
            }
        };

        while let Ok(event) = progress_rx.try_recv() {
            on_progress(event);
        }

        let peer = peer_id.to_string();
        let addresses = match outcome {
            None => {
                tracing::warn!(target: "peer", %peer_id, "peer lookup hit the deadline");
                return Err(IdentifyError::ResolutionTimeout { peer });
            }
            Some(Err(DhtQueryError::Timeout)) => {
                return Err(IdentifyError::ResolutionTimeout { peer });
            }
            Some(Err(DhtQueryError::NotFound)) => {
                return Err(IdentifyError::ResolutionFailed {
                    peer,
                    reason: "peer not found in the DHT".to_string(),
                });
            }
            Some(Err(DhtQueryError::Internal(reason))) => {
                return Err(IdentifyError::ResolutionFailed { peer, reason });
            }
            Some(Ok(addresses)) => addresses,
        };

        let found = addresses.len();
        let candidates = CandidateAddressSet::for_peer(&peer_id, addresses).ok_or_else(|| {
            IdentifyError::ResolutionFailed {
                peer: peer.clone(),
                reason: "lookup returned no dialable addresses".to_string(),
            }
        })?;

        tracing::info!(
            target: "peer",
            %peer_id,
            found,
            dialable = candidates.len(),
            "resolved peer addresses",
        );
        Ok(candidates)
    }
}
