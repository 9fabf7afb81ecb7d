//! peer-identify resolves a libp2p peer id or multiaddr to a live connection
//! and runs the identify handshake against it. It exposes a native Rust API
//! and a minimal C-compatible surface that can be consumed by other runtimes.

pub mod config;
pub mod error;
pub mod ffi;
pub mod identify;
pub mod peer;
pub mod transport;
pub mod workflow;

pub use error::{ErrorKind, IdentifyError};
pub use identify::{IdentifyResponse, PeerMetadataRecord, SequenceNumber, SignedPeerRecord};
pub use peer::*;
pub use transport::TransportConfig;
pub use workflow::{IdentifyWorkflow, ProgressQueue, WorkflowEvent, WorkflowEventSender};
