//! Command-driven event loop for managing the [`libp2p::Swarm`].
//!
//! The manager owns the swarm and answers [`PeerCommand`]s sent through a
//! [`PeerManagerHandle`]. Requests that complete later (DHT lookups, dials,
//! identify) park a oneshot responder keyed by the query or connection id and
//! are answered from the swarm event that settles them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    core::Multiaddr,
    identify,
    kad::{self, QueryResult},
    multiaddr::Protocol,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        ConnectionId, Swarm, SwarmEvent,
    },
    PeerId,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};

use crate::{
    identify::IdentifyResponse,
    peer::{
        connect::Connection,
        discovery::{
            trailing_peer_id, DhtQueryError, ProgressEvent, ProgressSender, FIND_NODE_QUERY,
        },
        node::NetworkNode,
    },
    transport::{BehaviourEvent, NetworkBehaviour, TransportConfig},
};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

type LookupResponder = oneshot::Sender<std::result::Result<Vec<Multiaddr>, DhtQueryError>>;
type DialResponder = oneshot::Sender<Result<Connection>>;
type IdentifyResponder = oneshot::Sender<Result<IdentifyResponse>>;

/// Commands supported by the [`PeerManager`] event loop.
#[derive(Debug)]
pub enum PeerCommand {
    /// Start listening on the provided multi-address.
    StartListening(Multiaddr),
    /// Look a peer up in the DHT, streaming progress while the query runs.
    FindPeer {
        peer_id: PeerId,
        progress: ProgressSender,
        response: LookupResponder,
    },
    /// Open a new connection using any of the given addresses.
    Dial {
        addresses: Vec<Multiaddr>,
        response: DialResponder,
    },
    /// Return the identify info received on an established connection.
    Identify {
        connection: Connection,
        response: IdentifyResponder,
    },
    /// Report how many peers we are connected to.
    ConnectedPeers { response: oneshot::Sender<usize> },
    /// Shut the manager down gracefully.
    Shutdown,
}

/// Handle that allows callers to enqueue [`PeerCommand`]s.
#[derive(Clone, Debug)]
pub struct PeerManagerHandle {
    command_sender: mpsc::Sender<PeerCommand>,
    local_peer_id: PeerId,
}

impl PeerManagerHandle {
    /// Enqueues a command to start listening on the given address.
    pub async fn start_listening(&self, address: Multiaddr) -> Result<()> {
        self.send(PeerCommand::StartListening(address)).await
    }

    /// Returns the local peer identifier.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Enqueues the shutdown command.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(PeerCommand::Shutdown).await
    }

    async fn send(&self, command: PeerCommand) -> Result<()> {
        self.command_sender
            .send(command)
            .await
            .map_err(|err| anyhow!("peer manager command channel closed: {err}"))
    }
}

#[async_trait]
impl NetworkNode for PeerManagerHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn find_peer(
        &self,
        peer_id: PeerId,
        progress: ProgressSender,
    ) -> std::result::Result<Vec<Multiaddr>, DhtQueryError> {
        let (tx, rx) = oneshot::channel();
        self.send(PeerCommand::FindPeer {
            peer_id,
            progress,
            response: tx,
        })
        .await
        .map_err(|err| DhtQueryError::Internal(err.to_string()))?;
        rx.await.map_err(|_| {
            DhtQueryError::Internal("find_peer query response channel closed".to_string())
        })?
    }

    async fn dial(&self, addresses: Vec<Multiaddr>) -> Result<Connection> {
        let (tx, rx) = oneshot::channel();
        self.send(PeerCommand::Dial {
            addresses,
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| anyhow!("dial response channel closed"))?
    }

    async fn identify(&self, connection: &Connection) -> Result<IdentifyResponse> {
        let (tx, rx) = oneshot::channel();
        self.send(PeerCommand::Identify {
            connection: connection.clone(),
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| anyhow!("identify response channel closed"))?
    }

    async fn active_connection_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(PeerCommand::ConnectedPeers { response: tx })
            .await?;
        rx.await
            .map_err(|_| anyhow!("connected peers response channel closed"))
    }
}

#[derive(Debug)]
struct PendingLookup {
    target: PeerId,
    /// Peers the query is asking about the target; dial activity towards
    /// anyone else is not part of this lookup.
    contacted: HashSet<PeerId>,
    progress: ProgressSender,
    response: LookupResponder,
}

impl PendingLookup {
    fn abandoned(&self) -> bool {
        self.response.is_closed()
    }

    fn report(&self, event: ProgressEvent) {
        if self.progress.send(event).is_err() {
            tracing::trace!(target: "peer", peer_id = %self.target, "lookup progress receiver dropped");
        }
    }
}

#[derive(Debug)]
struct PendingDial {
    addresses: Vec<Multiaddr>,
    response: DialResponder,
}

/// Manages the libp2p swarm and exposes a command-driven control loop.
pub struct PeerManager {
    swarm: Swarm<NetworkBehaviour>,
    command_receiver: mpsc::Receiver<PeerCommand>,
    local_peer_id: PeerId,
    lookups: HashMap<kad::QueryId, PendingLookup>,
    pending_dials: HashMap<ConnectionId, PendingDial>,
    identified: HashMap<ConnectionId, IdentifyResponse>,
    identify_failures: HashMap<ConnectionId, String>,
    pending_identify: HashMap<ConnectionId, Vec<IdentifyResponder>>,
}

impl PeerManager {
    /// Creates a new [`PeerManager`] instance alongside a [`PeerManagerHandle`].
    pub fn new(
        config: TransportConfig,
        bootstrap_peers: Vec<Multiaddr>,
    ) -> Result<(Self, PeerManagerHandle)> {
        let (keypair, swarm) = config.build()?;
        let local_peer_id = PeerId::from(keypair.public());
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let mut manager = Self {
            swarm,
            command_receiver,
            local_peer_id,
            lookups: HashMap::new(),
            pending_dials: HashMap::new(),
            identified: HashMap::new(),
            identify_failures: HashMap::new(),
            pending_identify: HashMap::new(),
        };

        manager.add_bootstrap_peers(bootstrap_peers);

        let handle = PeerManagerHandle {
            command_sender,
            local_peer_id,
        };
        Ok((manager, handle))
    }

    /// Returns the local peer identifier.
    pub fn peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Runs the peer manager control loop until shutdown is requested.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    let Some(command) = command else {
                        tracing::info!(target: "peer", "all handles dropped; stopping");
                        break;
                    };
                    if self.handle_command(command)? {
                        break;
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
            }
        }
        Ok(())
    }

    /// Processes a command and returns whether shutdown was requested
    fn handle_command(&mut self, command: PeerCommand) -> Result<bool> {
        match command {
            PeerCommand::StartListening(address) => {
                match self.swarm.listen_on(address.clone()) {
                    Ok(_) => tracing::info!(target: "peer", %address, "started listening"),
                    Err(err) => tracing::error!(target: "peer", %address, %err, "failed to listen"),
                }
                Ok(false)
            }
            PeerCommand::FindPeer {
                peer_id,
                progress,
                response,
            } => {
                self.start_lookup(peer_id, progress, response);
                Ok(false)
            }
            PeerCommand::Dial {
                addresses,
                response,
            } => {
                self.start_dial(addresses, response);
                Ok(false)
            }
            PeerCommand::Identify {
                connection,
                response,
            } => {
                self.request_identify(connection, response);
                Ok(false)
            }
            PeerCommand::ConnectedPeers { response } => {
                let count = self.swarm.network_info().num_peers();
                if response.send(count).is_err() {
                    tracing::trace!(target: "peer", "connected peers receiver dropped");
                }
                Ok(false)
            }
            PeerCommand::Shutdown => {
                tracing::info!(target: "peer", "shutdown requested");
                Ok(true)
            }
        }
    }

    fn start_lookup(&mut self, peer_id: PeerId, progress: ProgressSender, response: LookupResponder) {
        if peer_id == self.local_peer_id {
            let _ = response.send(Err(DhtQueryError::Internal(
                "refusing to look up the local peer".to_string(),
            )));
            return;
        }

        let known = self.known_addresses(&peer_id);
        if !known.is_empty() {
            tracing::info!(
                target: "peer",
                %peer_id,
                addresses = known.len(),
                "find_peer answered from the routing table",
            );
            if response.send(Ok(known)).is_err() {
                tracing::debug!(target: "peer", %peer_id, "find_peer receiver dropped");
            }
            return;
        }

        let kademlia = &mut self.swarm.behaviour_mut().kademlia;
        let key = kad::KBucketKey::from(peer_id);
        let contacted: HashSet<PeerId> = kademlia
            .get_closest_local_peers(&key)
            .map(|key| *key.preimage())
            .collect();
        let query_id = kademlia.get_closest_peers(peer_id);

        let lookup = PendingLookup {
            target: peer_id,
            contacted,
            progress,
            response,
        };
        lookup.report(ProgressEvent::SendingQuery {
            to: peer_id,
            query: FIND_NODE_QUERY.to_string(),
        });
        self.lookups.insert(query_id, lookup);

        tracing::info!(target: "peer", %peer_id, ?query_id, "started find_peer query");
    }

    /// Addresses the routing table already holds for `peer_id`.
    fn known_addresses(&mut self, peer_id: &PeerId) -> Vec<Multiaddr> {
        let Some(bucket) = self.swarm.behaviour_mut().kademlia.kbucket(*peer_id) else {
            return Vec::new();
        };
        let addresses = bucket
            .iter()
            .find(|entry| entry.node.key.preimage() == peer_id)
            .map(|entry| entry.node.value.iter().cloned().collect())
            .unwrap_or_default();
        addresses
    }

    fn start_dial(&mut self, addresses: Vec<Multiaddr>, response: DialResponder) {
        let opts = match (common_peer_id(&addresses), addresses.as_slice()) {
            (_, []) => {
                let _ = response.send(Err(anyhow!("no addresses to dial")));
                return;
            }
            (Some(peer_id), _) => DialOpts::peer_id(peer_id)
                .addresses(addresses.clone())
                .condition(PeerCondition::Always)
                .build(),
            (None, [address, ..]) => DialOpts::unknown_peer_id()
                .address(address.clone())
                .build(),
        };
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                tracing::info!(
                    target: "peer",
                    ?connection_id,
                    candidates = addresses.len(),
                    "dialing remote",
                );
                self.pending_dials.insert(
                    connection_id,
                    PendingDial {
                        addresses,
                        response,
                    },
                );
            }
            Err(err) => {
                tracing::warn!(target: "peer", %err, "failed to dial");
                let _ = response.send(Err(anyhow!(err)));
            }
        }
    }

    fn request_identify(&mut self, connection: Connection, response: IdentifyResponder) {
        if let Some(info) = self.identified.get(&connection.connection_id) {
            let _ = response.send(Ok(info.clone()));
            return;
        }

        if let Some(reason) = self.identify_failures.get(&connection.connection_id) {
            let _ = response.send(Err(anyhow!("{reason}")));
            return;
        }

        if !self.swarm.is_connected(&connection.peer_id) {
            let _ = response.send(Err(anyhow!(
                "not connected to {}; connection already closed",
                connection.peer_id
            )));
            return;
        }

        tracing::debug!(
            target: "peer",
            peer_id = %connection.peer_id,
            connection_id = ?connection.connection_id,
            "waiting for identify response",
        );
        self.pending_identify
            .entry(connection.connection_id)
            .or_default()
            .push(response);
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(target: "peer", %address, "listening on new address");
            }

            SwarmEvent::Dialing {
                peer_id,
                connection_id,
                ..
            } => {
                tracing::debug!(target: "peer", ?peer_id, ?connection_id, "dialing");
                if let Some(peer) = peer_id {
                    if !self.pending_dials.contains_key(&connection_id) {
                        self.report_peer_progress(peer, ProgressEvent::DialingPeer { peer });
                    }
                }
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                tracing::info!(target: "peer", %peer_id, ?connection_id, "connection established");

                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    let connection = Connection {
                        peer_id,
                        connection_id,
                        remote_address: endpoint.get_remote_address().clone(),
                    };
                    if pending.response.send(Ok(connection)).is_err() {
                        tracing::debug!(target: "peer", %peer_id, "dial receiver dropped");
                    }
                } else if endpoint.is_dialer() {
                    self.report_peer_progress(
                        peer_id,
                        ProgressEvent::SendingQuery {
                            to: peer_id,
                            query: FIND_NODE_QUERY.to_string(),
                        },
                    );
                }

                if num_established.get() == 1 && self.swarm.network_info().num_peers() == 1 {
                    if let Ok(query_id) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                        tracing::debug!(
                            target: "peer",
                            ?query_id,
                            %peer_id,
                            "started kademlia bootstrap after first connection",
                        );
                    }
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                self.identified.remove(&connection_id);
                self.identify_failures.remove(&connection_id);
                if let Some(waiters) = self.pending_identify.remove(&connection_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(anyhow!(
                            "connection to {peer_id} closed before identify completed"
                        )));
                    }
                }
                if let Some(error) = cause {
                    tracing::warn!(target: "peer", %peer_id, %error, "connection closed with error");
                } else {
                    tracing::info!(target: "peer", %peer_id, "connection closed");
                }
            }

            SwarmEvent::IncomingConnection { send_back_addr, .. } => {
                tracing::debug!(target: "peer", %send_back_addr, "incoming connection");
            }

            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                tracing::warn!(target: "peer", %send_back_addr, %error, "incoming connection error");
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id,
                connection_id,
                error,
                ..
            } => {
                tracing::warn!(target: "peer", ?peer_id, %error, "outgoing connection error");

                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    let reason = anyhow!(error.to_string()).context(format!(
                        "dial to {} candidate address(es) failed",
                        pending.addresses.len()
                    ));
                    let _ = pending.response.send(Err(reason));
                } else if let Some(from) = peer_id {
                    self.report_peer_progress(
                        from,
                        ProgressEvent::QueryError {
                            from,
                            code: "ERR_DIAL".to_string(),
                            message: error.to_string(),
                        },
                    );
                }
            }

            SwarmEvent::ListenerError { error, .. } => {
                tracing::error!(target: "peer", %error, "listener error");
            }

            _ => {}
        }
    }

    /// Handles events from additional network's features
    fn handle_behaviour_event(&mut self, event: BehaviourEvent) {
        match event {
            BehaviourEvent::Kademlia(event) => {
                self.handle_kademlia_event(event);
            }

            BehaviourEvent::Ping(event) => match event.result {
                Ok(rtt) => {
                    tracing::trace!(target: "peer", peer_id = %event.peer, ?rtt, "ping success");
                }
                Err(error) => {
                    tracing::debug!(target: "peer", peer_id = %event.peer, %error, "ping failure");
                }
            },

            BehaviourEvent::Identify(event) => self.handle_identify_event(event),
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        match event {
            identify::Event::Received {
                connection_id,
                peer_id,
                info,
                ..
            } => {
                tracing::debug!(
                    target: "peer",
                    %peer_id,
                    ?connection_id,
                    listen_addrs = info.listen_addrs.len(),
                    protocols = info.protocols.len(),
                    "identify received",
                );

                let mut unique_addresses = HashSet::new();
                for address in &info.listen_addrs {
                    if let Some(normalized) =
                        self.valid_kademlia_address(&peer_id, address, &mut unique_addresses)
                    {
                        self.swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&peer_id, normalized);
                    }
                }

                let response = IdentifyResponse::from_info(peer_id, &info);
                self.identify_failures.remove(&connection_id);
                if let Some(waiters) = self.pending_identify.remove(&connection_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(response.clone()));
                    }
                }
                self.identified.insert(connection_id, response);
            }

            identify::Event::Error {
                connection_id,
                peer_id,
                error,
                ..
            } => {
                tracing::warn!(target: "peer", %peer_id, %error, "identify error");
                let reason = format!("identify with {peer_id} failed: {error}");
                if let Some(waiters) = self.pending_identify.remove(&connection_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(anyhow!("{reason}")));
                    }
                }
                if !self.identified.contains_key(&connection_id) {
                    self.identify_failures.insert(connection_id, reason);
                }
            }

            other => tracing::trace!(target: "peer", ?other, "identify event"),
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                QueryResult::GetClosestPeers(res) => {
                    self.handle_lookup_result(id, res, step.last);
                }
                QueryResult::Bootstrap(res) => {
                    tracing::debug!(target: "peer", ?id, ok = res.is_ok(), "kademlia bootstrap step");
                }
                other => {
                    tracing::debug!(target: "peer", ?id, ?other, "unhandled kademlia query result");
                }
            },
            kad::Event::RoutingUpdated { peer, .. } => {
                tracing::trace!(target: "peer", %peer, "kademlia routing updated");
            }
            other => tracing::trace!(target: "peer", ?other, "kademlia event"),
        }
    }

    fn handle_lookup_result(
        &mut self,
        query_id: kad::QueryId,
        result: kad::GetClosestPeersResult,
        is_last: bool,
    ) {
        let Some(lookup) = self.lookups.get_mut(&query_id) else {
            tracing::debug!(target: "peer", ?query_id, "ignoring untracked kademlia query");
            return;
        };
        let target = lookup.target;

        let (peers, timed_out) = match &result {
            Ok(ok) => (ok.peers.as_slice(), false),
            Err(kad::GetClosestPeersError::Timeout { peers, .. }) => (peers.as_slice(), true),
        };

        let addresses: Vec<Multiaddr> = peers
            .iter()
            .filter(|info| info.peer_id == target)
            .flat_map(|info| info.addrs.iter().cloned())
            .collect();

        if !addresses.is_empty() {
            tracing::info!(
                target: "peer",
                %target,
                ?query_id,
                addresses = addresses.len(),
                "find_peer located target",
            );
            self.finish_lookup(query_id, Ok(addresses));
            return;
        }

        if !is_last {
            lookup.contacted.extend(peers.iter().map(|info| info.peer_id));
            lookup.report(ProgressEvent::Other {
                name: "kad-dht:query:peer-response".to_string(),
            });
            return;
        }

        let outcome = if timed_out {
            tracing::warn!(target: "peer", %target, ?query_id, "find_peer query timed out");
            Err(DhtQueryError::Timeout)
        } else {
            tracing::warn!(target: "peer", %target, ?query_id, "find_peer did not return the target peer");
            Err(DhtQueryError::NotFound)
        };
        self.finish_lookup(query_id, outcome);
    }

    fn finish_lookup(
        &mut self,
        query_id: kad::QueryId,
        outcome: std::result::Result<Vec<Multiaddr>, DhtQueryError>,
    ) {
        if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&query_id) {
            query.finish();
        }
        if let Some(lookup) = self.lookups.remove(&query_id) {
            if lookup.response.send(outcome).is_err() {
                tracing::debug!(target: "peer", ?query_id, "find_peer receiver dropped");
            }
        }
    }

    /// Forwards dial activity towards `peer` to the lookups contacting it.
    fn report_peer_progress(&mut self, peer: PeerId, event: ProgressEvent) {
        self.finish_abandoned_lookups();

        for lookup in self
            .lookups
            .values()
            .filter(|lookup| lookup.contacted.contains(&peer))
        {
            lookup.report(event.clone());
        }
    }

    fn finish_abandoned_lookups(&mut self) {
        let abandoned: Vec<kad::QueryId> = self
            .lookups
            .iter()
            .filter(|(_, lookup)| lookup.abandoned())
            .map(|(query_id, _)| *query_id)
            .collect();
        for query_id in abandoned {
            tracing::debug!(target: "peer", ?query_id, "finishing abandoned find_peer query");
            self.lookups.remove(&query_id);
            if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&query_id) {
                query.finish();
            }
        }
    }

    // Processes address to find valid, and non dublicated
    fn valid_kademlia_address(
        &self,
        peer_id: &PeerId,
        address: &Multiaddr,
        unique_addresses: &mut HashSet<Multiaddr>,
    ) -> Option<Multiaddr> {
        if *peer_id == self.local_peer_id {
            return None;
        }

        let mut normalized = address.clone();
        match normalized.iter().last() {
            Some(Protocol::P2p(last_peer_id)) if last_peer_id == *peer_id => {
                normalized.pop();
            }
            Some(Protocol::P2p(last_peer_id)) => {
                tracing::debug!(
                    target: "peer",
                    %peer_id,
                    %address,
                    last_peer_id = %last_peer_id,
                    "skipping address with mismatched trailing peer id",
                );
                return None;
            }
            _ => {}
        }

        if normalized.is_empty() || !unique_addresses.insert(normalized.clone()) {
            return None;
        }

        Some(normalized)
    }

    // Adding bootstraps into node's DHT initial network
    fn add_bootstrap_peers(&mut self, peers: Vec<Multiaddr>) {
        let mut added = 0usize;

        for mut addr in peers {
            match addr.pop() {
                Some(Protocol::P2p(peer_id)) => {
                    tracing::info!(
                        target: "peer",
                        %peer_id,
                        address = %addr,
                        "adding bootstrap peer"
                    );
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    added += 1;
                }
                other => {
                    tracing::warn!(
                        target: "peer",
                        ?other,
                        address = %addr,
                        "bootstrap peer missing p2p component"
                    );
                }
            }
        }

        if added == 0 {
            return;
        }

        match self.swarm.behaviour_mut().kademlia.bootstrap() {
            Ok(query_id) => {
                tracing::info!(target: "peer", ?query_id, added, "started kademlia bootstrap");
            }
            Err(err) => {
                tracing::warn!(target: "peer", %err, added, "failed to start kademlia bootstrap");
            }
        }
    }
}

/// The peer id shared by every address, if each one ends in the same `/p2p`.
fn common_peer_id(addresses: &[Multiaddr]) -> Option<PeerId> {
    let mut ids = addresses.iter().map(trailing_peer_id);
    let first = ids.next()??;
    ids.all(|id| id == Some(first)).then_some(first)
}
