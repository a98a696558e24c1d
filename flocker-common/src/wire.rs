//! Versioned wire codec for configuration and state payloads.
//!
//! Every payload travels inside an envelope carrying the codec version, so
//! an old control service refuses documents written by a newer one instead
//! of misreading them. Encoding is canonical: the model uses ordered
//! collections and serde emits struct fields in declaration order, so equal
//! values always produce byte-identical output and an unchanged snapshot
//! never looks like a change.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CODEC_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unsupported wire version {found} (this build supports up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("malformed wire payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    payload: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let envelope = Envelope {
        version: CODEC_VERSION,
        payload: value,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    let probe: VersionProbe = serde_json::from_slice(bytes)?;
    if probe.version > CODEC_VERSION {
        return Err(WireError::UnsupportedVersion {
            found: probe.version,
            supported: CODEC_VERSION,
        });
    }
    let envelope: Envelope<T> = serde_json::from_slice(bytes)?;
    Ok(envelope.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dataset, Deployment, Manifestation, NodeConfig, CONFIG_VERSION};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn sample_deployment() -> Deployment {
        let node_uuid = Uuid::new_v4();
        let dataset_id = Uuid::new_v4();
        let mut node = NodeConfig::new(node_uuid, "10.0.0.1");
        let mut dataset = Dataset::new(dataset_id);
        dataset.metadata.insert("name".to_string(), "db".to_string());
        dataset.maximum_size = Some(107_374_182_400);
        node.manifestations.insert(
            dataset_id,
            Manifestation {
                dataset,
                primary: true,
            },
        );
        Deployment {
            version: CONFIG_VERSION,
            nodes: BTreeMap::from([(node_uuid, node)]),
        }
    }

    #[test]
    fn round_trip() {
        let deployment = sample_deployment();
        let bytes = encode(&deployment).unwrap();
        let decoded: Deployment = decode(&bytes).unwrap();
        assert_eq!(decoded, deployment);
    }

    #[test]
    fn canonical_encoding() {
        // Two structurally equal values encode to identical bytes even when
        // built in different insertion orders.
        let a = sample_deployment();
        let mut b = Deployment {
            version: a.version,
            nodes: BTreeMap::new(),
        };
        for (uuid, node) in a.nodes.iter().rev() {
            b.nodes.insert(*uuid, node.clone());
        }
        assert_eq!(a, b);
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[test]
    fn refuses_newer_version() {
        let deployment = sample_deployment();
        let mut raw: serde_json::Value =
            serde_json::from_slice(&encode(&deployment).unwrap()).unwrap();
        raw["version"] = serde_json::json!(CODEC_VERSION + 1);
        let bytes = serde_json::to_vec(&raw).unwrap();
        match decode::<Deployment>(&bytes) {
            Err(WireError::UnsupportedVersion { found, supported }) => {
                assert_eq!(found, CODEC_VERSION + 1);
                assert_eq!(supported, CODEC_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {:?}", other.map(|_| ())),
        }
    }
}
