//! Identify handshake and normalization of its result.

pub mod exchange;
pub mod record;

pub use exchange::{
    IdentifyExchanger, IdentifyResponse, SequenceNumber, SignedPeerRecord, BIG_INTEGER_MARKER,
};
pub use record::{normalize, PeerMetadataRecord, ResultNormalizer, SignedPeerRecordView};
