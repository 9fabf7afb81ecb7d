//! Libp2p transport and behaviour configuration.

use anyhow::{anyhow, Context, Result};
use futures::future::Either;
use libp2p::{
    core::{
        muxing::StreamMuxerBox,
        transport::{Boxed, Transport},
        upgrade,
    },
    dns, identify, identity,
    kad::{self, store::MemoryStore},
    noise, ping, quic,
    swarm::{Config as SwarmConfig, Swarm},
    tcp, PeerId,
};
use std::time::Duration;

/// Protocol version announced in our own identify responses.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "ipfs/0.1.0";
/// Agent version announced unless the caller overrides it.
pub const DEFAULT_AGENT_VERSION: &str = concat!("peer-identify/", env!("CARGO_PKG_VERSION"));

const KAD_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Combined libp2p behaviour used across the node.
#[derive(libp2p::swarm::NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
pub struct NetworkBehaviour {
    /// Kademlia DHT behaviour for peer routing
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Identify protocol, run on every new connection
    pub identify: identify::Behaviour,
    /// Ping behaviour to keep connections alive and measure latency
    pub ping: ping::Behaviour,
}

/// Event type produced by the composed [`NetworkBehaviour`].
#[derive(Debug)]
pub enum BehaviourEvent {
    Kademlia(kad::Event),
    Identify(identify::Event),
    Ping(ping::Event),
}

impl From<kad::Event> for BehaviourEvent {
    fn from(event: kad::Event) -> Self {
        Self::Kademlia(event)
    }
}

impl From<identify::Event> for BehaviourEvent {
    fn from(event: identify::Event) -> Self {
        Self::Identify(event)
    }
}

impl From<ping::Event> for BehaviourEvent {
    fn from(event: ping::Event) -> Self {
        Self::Ping(event)
    }
}

/// Transport configuration builder.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// When set, enable QUIC support alongside TCP.
    pub use_quic: bool,
    /// Optional ed25519 secret used instead of a freshly generated identity.
    pub identity_seed: Option<[u8; 32]>,
    /// Agent version reported to remote peers.
    pub agent_version: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            use_quic: false,
            identity_seed: None,
            agent_version: DEFAULT_AGENT_VERSION.to_string(),
        }
    }
}

impl TransportConfig {
    pub fn new(use_quic: bool) -> Self {
        Self {
            use_quic,
            ..Self::default()
        }
    }

    /// Uses a deterministic identity derived from `seed`.
    pub fn with_identity_seed(mut self, seed: [u8; 32]) -> Self {
        self.identity_seed = Some(seed);
        self
    }

    pub fn with_agent_version(mut self, agent_version: impl Into<String>) -> Self {
        self.agent_version = agent_version.into();
        self
    }

    /// Builds the swarm using the provided configuration.
    pub fn build(&self) -> Result<(identity::Keypair, Swarm<NetworkBehaviour>)> {
        let keypair = self.keypair()?;
        let local_peer_id = PeerId::from(keypair.public());
        let transport = self.build_transport(&keypair)?;
        let behaviour = self.build_behaviour(&keypair);
        let swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            SwarmConfig::with_tokio_executor().with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT),
        );
        Ok((keypair, swarm))
    }

    fn keypair(&self) -> Result<identity::Keypair> {
        match self.identity_seed {
            Some(mut seed) => identity::Keypair::ed25519_from_bytes(&mut seed)
                .context("invalid ed25519 identity seed"),
            None => Ok(identity::Keypair::generate_ed25519()),
        }
    }

    /// Constructs the composite network behaviour using the supplied keypair
    fn build_behaviour(&self, keypair: &identity::Keypair) -> NetworkBehaviour {
        let peer_id = PeerId::from(keypair.public());
        let mut kad_config = kad::Config::new(kad::PROTOCOL_NAME);
        kad_config.set_query_timeout(KAD_QUERY_TIMEOUT);
        let store = MemoryStore::new(peer_id);

        let identify_config =
            identify::Config::new(IDENTIFY_PROTOCOL_VERSION.into(), keypair.public())
                .with_agent_version(self.agent_version.clone())
                .with_push_listen_addr_updates(false);

        NetworkBehaviour {
            kademlia: kad::Behaviour::with_config(peer_id, store, kad_config),
            identify: identify::Behaviour::new(identify_config),
            ping: ping::Behaviour::new(ping::Config::new()),
        }
    }

    /// Builds the transport stack using DNS-resolving TCP and optionally QUIC
    fn build_transport(&self, keypair: &identity::Keypair) -> Result<Boxed<(PeerId, StreamMuxerBox)>> {
        let noise_config = noise::Config::new(keypair)
            .map_err(|err| anyhow!("failed to create noise config: {err}"))?;

        let tcp_transport = Self::build_tcp_transport(noise_config)?;

        if !self.use_quic {
            return Ok(tcp_transport);
        }

        let quic_transport = Self::build_quic_transport(keypair);
        Ok(quic_transport
            .or_transport(tcp_transport)
            .map(|either, _| match either {
                Either::Left(output) | Either::Right(output) => output,
            })
            .boxed())
    }

    /// Configures TCP behind the system DNS resolver with Noise authentication
    /// and Yamux multiplexing, so `/dnsaddr` bootstrap entries are dialable
    fn build_tcp_transport(noise_config: noise::Config) -> Result<Boxed<(PeerId, StreamMuxerBox)>> {
        let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
        let dns_transport = dns::tokio::Transport::system(tcp_transport)
            .context("failed to read system DNS configuration")?;
        Ok(dns_transport
            .upgrade(upgrade::Version::V1Lazy)
            .authenticate(noise_config)
            .multiplex(libp2p::yamux::Config::default())
            .boxed())
    }

    /// Configures QUIC transport for encrypted, multiplexed streams
    fn build_quic_transport(keypair: &identity::Keypair) -> Boxed<(PeerId, StreamMuxerBox)> {
        let quic_config = quic::Config::new(keypair);

        quic::tokio::Transport::new(quic_config)
            .map(|(peer_id, connection), _| (peer_id, StreamMuxerBox::new(connection)))
            .boxed()
    }
}
