//! Peer resolution, dialing and the libp2p node that backs them.

pub mod connect;
pub mod discovery;
pub mod manager;
pub mod node;
pub mod readiness;
pub mod reference;

pub use connect::{Connection, ConnectionEstablisher};
pub use discovery::{
    AddressResolver, CandidateAddressSet, DhtQueryError, ProgressEvent, ProgressSender,
};
pub use manager::{PeerCommand, PeerManager, PeerManagerHandle};
pub use node::NetworkNode;
pub use readiness::PeerReadinessGate;
pub use reference::PeerReference;
