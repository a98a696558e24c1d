//! Convergence planning: diff this node's observed state against its slice
//! of the desired configuration and pick exactly one action.
//!
//! Discrepancies resolve in a fixed priority order. Releasing actions come
//! before acquiring actions so resources freed by one step are available to
//! the next, and a primary is always handed off before it is received
//! anywhere else, so the cluster never sees two simultaneous primaries.
//! The plan is recomputed from scratch on every loop, so a persistently
//! failing action never blocks a newly required higher-priority one.

use uuid::Uuid;

use flocker_common::model::{Application, Deployment, DeploymentState, NodeState};
use flocker_drivers::BlockDeviceVolume;

/// One convergence step. Variants are ordered by resolution priority.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StopContainer {
        name: String,
    },
    DetachVolume {
        volume_id: String,
        dataset_id: Uuid,
    },
    DestroyDataset {
        volume_id: String,
        dataset_id: Uuid,
    },
    HandoffPrimary {
        dataset_id: Uuid,
        target_node: Uuid,
    },
    ReceivePrimary {
        dataset_id: Uuid,
        source_node: Uuid,
    },
    CreateDataset {
        dataset_id: Uuid,
        maximum_size: Option<u64>,
    },
    AttachVolume {
        volume_id: String,
        dataset_id: Uuid,
    },
    StartContainer {
        application: Application,
    },
}

/// Pick the smallest-priority applicable action, or `None` when this node
/// has converged on its slice of the configuration.
pub fn plan(
    configuration: &Deployment,
    cluster: &DeploymentState,
    local: &NodeState,
    volumes: &[BlockDeviceVolume],
    instance_id: &str,
) -> Option<Action> {
    let node_uuid = local.node_uuid;
    let desired = configuration.node(&node_uuid);
    let desired_apps: &[Application] = desired.map(|n| n.applications.as_slice()).unwrap_or(&[]);

    let mut attached_here: Vec<&BlockDeviceVolume> = volumes
        .iter()
        .filter(|v| v.attached_to.as_deref() == Some(instance_id))
        .collect();
    attached_here.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));

    // 1. Stop containers that are not wanted, differ from what is wanted,
    //    or have died (they are recreated at priority 8).
    let mut observed: Vec<_> = local.containers.iter().collect();
    observed.sort_by(|a, b| a.application.name.cmp(&b.application.name));
    for container in &observed {
        let wanted = desired_apps
            .iter()
            .find(|a| a.name == container.application.name);
        let diverged = match wanted {
            None => true,
            Some(wanted) => *wanted != container.application || !container.running,
        };
        if diverged {
            return Some(Action::StopContainer {
                name: container.application.name.clone(),
            });
        }
    }

    // 2. Detach volumes that are not required here, belong to a dataset
    //    whose primary is moving away, or are tombstoned.
    for volume in &attached_here {
        let tombstoned = configuration
            .dataset(&volume.dataset_id)
            .map(|d| d.deleted)
            .unwrap_or(false);
        let desired_primary = configuration.primary_node(&volume.dataset_id);
        if tombstoned || desired_primary != Some(node_uuid) {
            return Some(Action::DetachVolume {
                volume_id: volume.volume_id.clone(),
                dataset_id: volume.dataset_id,
            });
        }
    }

    // 3. Destroy tombstoned datasets once their volume is released.
    let mut unattached: Vec<&BlockDeviceVolume> =
        volumes.iter().filter(|v| v.attached_to.is_none()).collect();
    unattached.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
    for volume in &unattached {
        let tombstoned = configuration
            .dataset(&volume.dataset_id)
            .map(|d| d.deleted)
            .unwrap_or(false);
        if tombstoned {
            return Some(Action::DestroyDataset {
                volume_id: volume.volume_id.clone(),
                dataset_id: volume.dataset_id,
            });
        }
    }

    // 4. Hand off primaries that should live elsewhere. On block backends
    //    the detach above already released the volume; this step pushes the
    //    final snapshot stream on snapshot-capable filesystems.
    for (dataset_id, manifestation) in &local.manifestations {
        if !manifestation.primary {
            continue;
        }
        let still_attached = attached_here.iter().any(|v| v.dataset_id == *dataset_id);
        match configuration.primary_node(dataset_id) {
            Some(target) if target != node_uuid && !still_attached => {
                return Some(Action::HandoffPrimary {
                    dataset_id: *dataset_id,
                    target_node: target,
                });
            }
            _ => {}
        }
    }

    let desired_manifestations = desired.map(|n| &n.manifestations);

    // 5. Receive primaries that are desired here while another node still
    //    holds them. The executor waits for the current primary to release
    //    the volume before attaching, so both never hold it at once.
    if let Some(manifestations) = desired_manifestations {
        for (dataset_id, manifestation) in manifestations {
            if !manifestation.primary || manifestation.dataset.deleted {
                continue;
            }
            if let Some(source) = cluster.primary_node(dataset_id) {
                if source != node_uuid {
                    return Some(Action::ReceivePrimary {
                        dataset_id: *dataset_id,
                        source_node: source,
                    });
                }
            }
        }

        // 6. Create datasets that exist nowhere in the cluster.
        for (dataset_id, manifestation) in manifestations {
            if !manifestation.primary || manifestation.dataset.deleted {
                continue;
            }
            let backend_has_it = volumes.iter().any(|v| v.dataset_id == *dataset_id);
            if !cluster.dataset_exists(dataset_id) && !backend_has_it {
                return Some(Action::CreateDataset {
                    dataset_id: *dataset_id,
                    maximum_size: manifestation.dataset.maximum_size,
                });
            }
        }

        // 7. Attach volumes for primaries desired here that are not yet
        //    materialised on this host.
        for (dataset_id, manifestation) in manifestations {
            if !manifestation.primary || manifestation.dataset.deleted {
                continue;
            }
            let candidate = unattached.iter().find(|v| v.dataset_id == *dataset_id);
            if let Some(volume) = candidate {
                return Some(Action::AttachVolume {
                    volume_id: volume.volume_id.clone(),
                    dataset_id: *dataset_id,
                });
            }
        }
    }

    // 8. Start desired containers that are not running. A container whose
    //    volume is not yet attached here has to wait for priorities 5-7.
    for application in desired_apps {
        if local.container(&application.name).is_some() {
            continue;
        }
        let volume_ready = match &application.volume {
            None => true,
            Some(volume) => attached_here
                .iter()
                .any(|v| v.dataset_id == volume.dataset_id),
        };
        if volume_ready {
            return Some(Action::StartContainer {
                application: application.clone(),
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use flocker_common::model::{
        AttachedVolume, Dataset, Manifestation, NodeConfig, ObservedContainer,
    };
    use std::collections::{BTreeMap, BTreeSet};

    const INSTANCE: &str = "i-node-a";

    struct Fixture {
        node_uuid: Uuid,
        configuration: Deployment,
        cluster: DeploymentState,
        local: NodeState,
        volumes: Vec<BlockDeviceVolume>,
    }

    impl Fixture {
        fn new() -> Self {
            let node_uuid = Uuid::new_v4();
            let mut configuration = Deployment::default();
            configuration
                .nodes
                .insert(node_uuid, NodeConfig::new(node_uuid, "10.0.0.1"));
            Fixture {
                node_uuid,
                configuration,
                cluster: DeploymentState::default(),
                local: NodeState::new(node_uuid, "10.0.0.1"),
                volumes: Vec::new(),
            }
        }

        fn desired(&mut self) -> &mut NodeConfig {
            self.configuration.nodes.get_mut(&self.node_uuid).unwrap()
        }

        fn plan(&self) -> Option<Action> {
            plan(
                &self.configuration,
                &self.cluster,
                &self.local,
                &self.volumes,
                INSTANCE,
            )
        }
    }

    fn app(name: &str) -> Application {
        Application {
            name: name.to_string(),
            image: "busybox:latest".parse().unwrap(),
            ports: BTreeSet::new(),
            links: BTreeSet::new(),
            environment: BTreeMap::new(),
            memory_limit: None,
            cpu_shares: None,
            volume: None,
        }
    }

    fn manifestation(dataset_id: Uuid, deleted: bool) -> Manifestation {
        let mut dataset = Dataset::new(dataset_id);
        dataset.deleted = deleted;
        Manifestation {
            dataset,
            primary: true,
        }
    }

    fn volume(dataset_id: Uuid, attached_to: Option<&str>) -> BlockDeviceVolume {
        BlockDeviceVolume {
            volume_id: format!("vol-{}", dataset_id),
            size: flocker_drivers::GIB,
            attached_to: attached_to.map(str::to_string),
            dataset_id,
        }
    }

    #[test]
    fn converged_node_plans_nothing() {
        let mut fixture = Fixture::new();
        fixture.desired().applications.push(app("web"));
        fixture.local.containers.push(ObservedContainer {
            application: app("web"),
            running: true,
        });
        assert_eq!(fixture.plan(), None);
    }

    #[test]
    fn unwanted_container_is_stopped() {
        let mut fixture = Fixture::new();
        fixture.local.containers.push(ObservedContainer {
            application: app("stray"),
            running: true,
        });
        assert_eq!(
            fixture.plan(),
            Some(Action::StopContainer {
                name: "stray".to_string()
            })
        );
    }

    #[test]
    fn diverged_container_is_stopped_before_anything_starts() {
        let mut fixture = Fixture::new();
        let mut wanted = app("web");
        wanted.image = "nginx:1.27".parse().unwrap();
        fixture.desired().applications.push(wanted);
        fixture.desired().applications.push(app("other"));
        // Observed "web" runs the old image; "other" is missing entirely.
        fixture.local.containers.push(ObservedContainer {
            application: app("web"),
            running: true,
        });
        assert_eq!(
            fixture.plan(),
            Some(Action::StopContainer {
                name: "web".to_string()
            })
        );
    }

    #[test]
    fn dead_container_is_removed_then_restarted() {
        let mut fixture = Fixture::new();
        fixture.desired().applications.push(app("web"));
        fixture.local.containers.push(ObservedContainer {
            application: app("web"),
            running: false,
        });
        assert_eq!(
            fixture.plan(),
            Some(Action::StopContainer {
                name: "web".to_string()
            })
        );
    }

    #[test]
    fn volume_for_moving_dataset_is_detached() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        let other_node = Uuid::new_v4();
        let mut other = NodeConfig::new(other_node, "10.0.0.2");
        other
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, false));
        fixture.configuration.nodes.insert(other_node, other);
        fixture.volumes.push(volume(dataset_id, Some(INSTANCE)));

        assert_eq!(
            fixture.plan(),
            Some(Action::DetachVolume {
                volume_id: format!("vol-{}", dataset_id),
                dataset_id,
            })
        );
    }

    #[test]
    fn tombstoned_dataset_detaches_then_destroys() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        fixture
            .desired()
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, true));

        fixture.volumes.push(volume(dataset_id, Some(INSTANCE)));
        assert!(matches!(
            fixture.plan(),
            Some(Action::DetachVolume { .. })
        ));

        fixture.volumes[0].attached_to = None;
        assert_eq!(
            fixture.plan(),
            Some(Action::DestroyDataset {
                volume_id: format!("vol-{}", dataset_id),
                dataset_id,
            })
        );
    }

    #[test]
    fn live_dataset_is_never_destroyed() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        // Unattached volume for a dataset absent from configuration: it is
        // detachable leftovers, but without a tombstone it stays alive.
        fixture.volumes.push(volume(dataset_id, None));
        assert_eq!(fixture.plan(), None);
    }

    #[test]
    fn released_primary_is_handed_off() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        let mut other = NodeConfig::new(target, "10.0.0.2");
        other
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, false));
        fixture.configuration.nodes.insert(target, other);
        // Snapshot-capable manifestation still present locally, block
        // volume already released.
        fixture
            .local
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, false));

        assert_eq!(
            fixture.plan(),
            Some(Action::HandoffPrimary {
                dataset_id,
                target_node: target,
            })
        );
    }

    #[test]
    fn desired_primary_here_waits_to_receive_from_current_holder() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        let source = Uuid::new_v4();
        fixture
            .desired()
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, false));
        let mut holder = NodeState::new(source, "10.0.0.2");
        holder
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, false));
        fixture.cluster.nodes.insert(source, holder);
        // The old primary has not detached yet.
        fixture.volumes.push(volume(dataset_id, Some("i-node-b")));

        assert_eq!(
            fixture.plan(),
            Some(Action::ReceivePrimary {
                dataset_id,
                source_node: source,
            })
        );
    }

    #[test]
    fn missing_dataset_is_created() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        let mut wanted = manifestation(dataset_id, false);
        wanted.dataset.maximum_size = Some(107_374_182_400);
        fixture.desired().manifestations.insert(dataset_id, wanted);

        assert_eq!(
            fixture.plan(),
            Some(Action::CreateDataset {
                dataset_id,
                maximum_size: Some(107_374_182_400),
            })
        );
    }

    #[test]
    fn existing_nonmanifest_volume_is_attached_not_recreated() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        fixture
            .desired()
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, false));
        fixture.volumes.push(volume(dataset_id, None));
        fixture
            .cluster
            .nonmanifest
            .insert(dataset_id, Dataset::new(dataset_id));

        assert_eq!(
            fixture.plan(),
            Some(Action::AttachVolume {
                volume_id: format!("vol-{}", dataset_id),
                dataset_id,
            })
        );
    }

    #[test]
    fn container_with_unattached_volume_does_not_start() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        let mut db = app("db");
        db.volume = Some(AttachedVolume {
            dataset_id,
            mountpoint: "/data".into(),
        });
        fixture.desired().applications.push(db);
        // No manifestation configured here and no volume: the planner must
        // not start the container on an absent dataset.
        assert_eq!(fixture.plan(), None);
    }

    #[test]
    fn container_starts_once_volume_is_attached() {
        let mut fixture = Fixture::new();
        let dataset_id = Uuid::new_v4();
        let mut db = app("db");
        db.volume = Some(AttachedVolume {
            dataset_id,
            mountpoint: "/data".into(),
        });
        fixture.desired().applications.push(db.clone());
        fixture
            .desired()
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, false));
        fixture.volumes.push(volume(dataset_id, Some(INSTANCE)));
        fixture
            .local
            .manifestations
            .insert(dataset_id, manifestation(dataset_id, false));

        assert_eq!(
            fixture.plan(),
            Some(Action::StartContainer { application: db })
        );
    }

    #[test]
    fn stateless_container_starts_immediately() {
        let mut fixture = Fixture::new();
        fixture.desired().applications.push(app("web"));
        assert_eq!(
            fixture.plan(),
            Some(Action::StartContainer {
                application: app("web")
            })
        );
    }

    #[test]
    fn unconfigured_node_stops_everything_and_releases() {
        let mut fixture = Fixture::new();
        fixture.configuration.nodes.clear();
        fixture.local.containers.push(ObservedContainer {
            application: app("web"),
            running: true,
        });
        let dataset_id = Uuid::new_v4();
        fixture.volumes.push(volume(dataset_id, Some(INSTANCE)));

        // Stop first, then detach on the next round.
        assert!(matches!(
            fixture.plan(),
            Some(Action::StopContainer { .. })
        ));
        fixture.local.containers.clear();
        assert!(matches!(
            fixture.plan(),
            Some(Action::DetachVolume { .. })
        ));
    }
}
