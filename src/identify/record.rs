//! Canonical, serializable form of an identify response.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::identify::exchange::{IdentifyResponse, SignedPeerRecord};

/// Normalized peer metadata, serialized with stable camelCase keys.
///
/// `publicKey` and `signedPeerRecord` are omitted entirely when the peer did
/// not send them; every other key is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetadataRecord {
    pub peer_id: String,
    pub agent_version: String,
    pub protocol_version: String,
    pub observed_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub listen_addrs: Vec<String>,
    pub protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_peer_record: Option<SignedPeerRecordView>,
}

/// Text form of a [`SignedPeerRecord`]. `seq` carries the big-integer marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPeerRecordView {
    pub seq: String,
    pub addresses: Vec<String>,
}

impl PeerMetadataRecord {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize peer metadata")
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize peer metadata")
    }
}

/// Maps raw identify responses to [`PeerMetadataRecord`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResultNormalizer;

impl ResultNormalizer {
    /// Pure and total: the same response always yields the same record.
    pub fn normalize(&self, response: &IdentifyResponse) -> PeerMetadataRecord {
        normalize(response)
    }
}

pub fn normalize(response: &IdentifyResponse) -> PeerMetadataRecord {
    PeerMetadataRecord {
        peer_id: response.peer_id.to_string(),
        agent_version: response.agent_version.clone(),
        protocol_version: response.protocol_version.clone(),
        observed_addr: response.observed_addr.to_string(),
        public_key: response
            .public_key
            .as_deref()
            .map(|bytes| multibase::encode(multibase::Base::Base58Btc, bytes)),
        listen_addrs: response.listen_addrs.iter().map(ToString::to_string).collect(),
        protocols: response.protocols.clone(),
        signed_peer_record: response.signed_peer_record.as_ref().map(view),
    }
}

fn view(record: &SignedPeerRecord) -> SignedPeerRecordView {
    SignedPeerRecordView {
        seq: record.seq.to_tagged_string(),
        addresses: record.addresses.iter().map(ToString::to_string).collect(),
    }
}
