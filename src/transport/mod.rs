//! Transport configuration and builders.

pub mod libp2p;

pub use libp2p::{
    BehaviourEvent, NetworkBehaviour, TransportConfig, DEFAULT_AGENT_VERSION,
    IDENTIFY_PROTOCOL_VERSION,
};
