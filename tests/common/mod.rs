//! In-memory [`NetworkNode`] used by the integration tests.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use libp2p::{identity::Keypair, swarm::ConnectionId, Multiaddr, PeerId};
use peer_identify::{
    discovery::trailing_peer_id, Connection, DhtQueryError, IdentifyResponse, NetworkNode,
    ProgressEvent, ProgressSender,
};

/// How a scripted call behaves.
#[derive(Debug, Clone)]
pub enum Step {
    Immediate,
    Delay(Duration),
    Hang,
    Fail(String),
}

impl Step {
    async fn run(&self) -> Result<()> {
        match self {
            Step::Immediate => Ok(()),
            Step::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            Step::Hang => std::future::pending().await,
            Step::Fail(message) => Err(anyhow!("{message}")),
        }
    }
}

pub struct FakeNode {
    pub local_peer_id: PeerId,
    pub remote: Keypair,
    lookup_events: Vec<ProgressEvent>,
    lookup_step: Step,
    lookup_result: std::result::Result<Vec<Multiaddr>, DhtQueryError>,
    dial_step: Step,
    identify_step: Step,
    response: IdentifyResponse,
    connection_counts: Mutex<VecDeque<usize>>,
    dialed: Mutex<Vec<Vec<Multiaddr>>>,
    find_peer_calls: AtomicUsize,
    dial_calls: AtomicUsize,
    identify_calls: AtomicUsize,
}

impl FakeNode {
    /// A node that knows one remote peer and answers everything immediately.
    pub fn new() -> Self {
        let remote = Keypair::generate_ed25519();
        let remote_peer_id = remote.public().to_peer_id();
        let response = IdentifyResponse {
            peer_id: remote_peer_id,
            agent_version: "fake-agent/1.0.0".to_string(),
            protocol_version: "ipfs/0.1.0".to_string(),
            observed_addr: "/ip4/203.0.113.7/tcp/50123".parse().unwrap(),
            public_key: Some(remote.public().encode_protobuf()),
            listen_addrs: vec!["/ip4/198.51.100.1/tcp/4001".parse().unwrap()],
            protocols: vec![
                "/ipfs/id/1.0.0".to_string(),
                "/ipfs/kad/1.0.0".to_string(),
            ],
            signed_peer_record: None,
        };

        Self {
            local_peer_id: PeerId::random(),
            remote,
            lookup_events: Vec::new(),
            lookup_step: Step::Immediate,
            lookup_result: Err(DhtQueryError::NotFound),
            dial_step: Step::Immediate,
            identify_step: Step::Immediate,
            response,
            connection_counts: Mutex::new(VecDeque::new()),
            dialed: Mutex::new(Vec::new()),
            find_peer_calls: AtomicUsize::new(0),
            dial_calls: AtomicUsize::new(0),
            identify_calls: AtomicUsize::new(0),
        }
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.response.peer_id
    }

    pub fn with_lookup(
        mut self,
        events: Vec<ProgressEvent>,
        result: std::result::Result<Vec<Multiaddr>, DhtQueryError>,
    ) -> Self {
        self.lookup_events = events;
        self.lookup_result = result;
        self
    }

    pub fn with_lookup_step(mut self, step: Step) -> Self {
        self.lookup_step = step;
        self
    }

    pub fn with_dial_step(mut self, step: Step) -> Self {
        self.dial_step = step;
        self
    }

    pub fn with_identify_step(mut self, step: Step) -> Self {
        self.identify_step = step;
        self
    }

    pub fn with_response(mut self, update: impl FnOnce(&mut IdentifyResponse)) -> Self {
        update(&mut self.response);
        self
    }

    /// Counts returned by successive `active_connection_count` calls; the last repeats.
    pub fn with_connection_counts(self, counts: impl IntoIterator<Item = usize>) -> Self {
        *self.connection_counts.lock().unwrap() = counts.into_iter().collect();
        self
    }

    pub fn find_peer_calls(&self) -> usize {
        self.find_peer_calls.load(Ordering::SeqCst)
    }

    pub fn dial_calls(&self) -> usize {
        self.dial_calls.load(Ordering::SeqCst)
    }

    pub fn identify_calls(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }

    pub fn dialed(&self) -> Vec<Vec<Multiaddr>> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkNode for FakeNode {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn find_peer(
        &self,
        _peer_id: PeerId,
        progress: ProgressSender,
    ) -> std::result::Result<Vec<Multiaddr>, DhtQueryError> {
        self.find_peer_calls.fetch_add(1, Ordering::SeqCst);
        for event in &self.lookup_events {
            let _ = progress.send(event.clone());
        }
        if let Err(err) = self.lookup_step.run().await {
            return Err(DhtQueryError::Internal(err.to_string()));
        }
        self.lookup_result.clone()
    }

    async fn dial(&self, addresses: Vec<Multiaddr>) -> Result<Connection> {
        self.dial_calls.fetch_add(1, Ordering::SeqCst);
        self.dialed.lock().unwrap().push(addresses.clone());
        self.dial_step.run().await?;

        let remote_address = addresses
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no addresses to dial"))?;
        let peer_id = trailing_peer_id(&remote_address).unwrap_or(self.response.peer_id);
        Ok(Connection {
            peer_id,
            connection_id: ConnectionId::new_unchecked(1),
            remote_address,
        })
    }

    async fn identify(&self, _connection: &Connection) -> Result<IdentifyResponse> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        self.identify_step.run().await?;
        Ok(self.response.clone())
    }

    async fn active_connection_count(&self) -> Result<usize> {
        let mut counts = self.connection_counts.lock().unwrap();
        let count = if counts.len() > 1 {
            counts.pop_front().unwrap_or_default()
        } else {
            counts.front().copied().unwrap_or_default()
        };
        Ok(count)
    }
}
