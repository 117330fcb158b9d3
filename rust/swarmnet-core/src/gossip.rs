use serde::{Deserialize, Serialize};

use crate::common::PeerId;

/// A human readable line describing one output of a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMessage {
    pub id: String,
    pub message: String,
    /// The nickname of the peer.
    pub node: String,
    pub node_id: PeerId,
    pub timestamp: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GossipFeed {
    pub messages: Vec<GossipMessage>,
}
