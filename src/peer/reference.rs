//! Parsing of user-supplied peer identifiers.

use std::{fmt, str::FromStr};

use libp2p::{Multiaddr, PeerId};

use crate::error::IdentifyError;

/// What the operator asked us to identify.
///
/// Anything starting with `/` is a multiaddr; everything else must be a peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerReference {
    /// A directly dialable multiaddr.
    Address(Multiaddr),
    /// A peer id that has to be looked up in the DHT first.
    OpaqueIdentity(PeerId),
}

impl PeerReference {
    /// Parses trimmed input. Empty input and malformed ids are `InvalidInput`.
    pub fn parse(input: &str) -> Result<Self, IdentifyError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdentifyError::invalid_input(input, "input is empty"));
        }

        if trimmed.starts_with('/') {
            Multiaddr::from_str(trimmed)
                .map(PeerReference::Address)
                .map_err(|err| IdentifyError::invalid_input(trimmed, err))
        } else {
            PeerId::from_str(trimmed)
                .map(PeerReference::OpaqueIdentity)
                .map_err(|err| IdentifyError::invalid_input(trimmed, err))
        }
    }

    pub fn is_address(&self) -> bool {
        matches!(self, PeerReference::Address(_))
    }
}

impl FromStr for PeerReference {
    type Err = IdentifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerReference::Address(address) => address.fmt(f),
            PeerReference::OpaqueIdentity(peer_id) => peer_id.fmt(f),
        }
    }
}
