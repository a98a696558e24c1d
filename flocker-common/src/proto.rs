//! Agent-control RPC message schema.
//!
//! The channel carries length-prefixed frames over mutual TLS; each frame
//! body is the wire encoding of one [`Message`]. The control service knows
//! the desired configuration and pushes it (together with aggregated state)
//! to every agent as a [`Message::ClusterStatus`]; agents push their local
//! observations up as [`Message::NodeState`]. Carrying configuration and
//! state in a single command keeps the agent's startup decision simple.
//!
//! Every command carries a `trace_id`, an opaque string minted by whoever
//! originated the change, so log events on both sides of the wire can be
//! correlated to a single operator action.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Deployment, DeploymentState, StateChange};

/// Protocol version. Semantic versioning at the major number: a mismatch
/// means the peers cannot talk and the agent refuses the connection.
pub const PROTOCOL_MAJOR: u32 = 1;

/// Upper bound on a single frame. A full cluster snapshot has to fit.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub const DEFAULT_RPC_PORT: u16 = 4524;
pub const DEFAULT_REST_PORT: u16 = 4523;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Agent → control, first frame after connecting.
    Version,
    /// Control → agent, in response to `Version`.
    VersionResponse { major: u32 },
    /// Control → agent. No response.
    ClusterStatus {
        configuration: Deployment,
        state: DeploymentState,
        trace_id: String,
    },
    /// Agent → control. No response.
    NodeState {
        changes: Vec<StateChange>,
        trace_id: String,
    },
}

pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeState, NonManifestDatasets};
    use crate::wire;

    #[test]
    fn message_round_trip() {
        let node_uuid = Uuid::new_v4();
        let message = Message::NodeState {
            changes: vec![
                StateChange::Node(NodeState::new(node_uuid, "10.0.0.1")),
                StateChange::NonManifest(NonManifestDatasets::default()),
            ],
            trace_id: new_trace_id(),
        };
        let bytes = wire::encode(&message).unwrap();
        let decoded: Message = wire::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn version_response_round_trip() {
        let bytes = wire::encode(&Message::VersionResponse {
            major: PROTOCOL_MAJOR,
        })
        .unwrap();
        match wire::decode(&bytes).unwrap() {
            Message::VersionResponse { major } => assert_eq!(major, PROTOCOL_MAJOR),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
