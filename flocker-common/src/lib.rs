// Shared types for the flocker control plane: the configuration/state data
// model, the wire codec, the agent RPC message schema and the mutual-TLS
// config builders used by both the control service and the agents.

pub mod model;
pub mod proto;
pub mod tls;
pub mod wire;

pub use model::{
    Application, AttachedVolume, Dataset, Deployment, DeploymentState, Image, Link, Manifestation,
    NodeConfig, NodeState, NonManifestDatasets, ObservedContainer, PortMap, StateChange,
};
pub use proto::{new_trace_id, Message, PROTOCOL_MAJOR};
