//! The convergence loop: a single cooperative state machine driven by three
//! events — the periodic tick, cluster updates from the control service,
//! and completion of the action in flight.
//!
//! On every wakeup the agent re-observes its node, publishes the fresh
//! state, recomputes the plan against the latest delivered target and
//! executes at most one action. Failures are logged with the trace id of
//! the inducing update and absorbed; the next tick starts from scratch, so
//! nothing ever wedges on a persistently failing step.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use flocker_common::model::{Deployment, DeploymentState};
use flocker_common::proto::{new_trace_id, Message};
use flocker_drivers::VolumeError;

use crate::executor::Executor;
use crate::observer::Observer;
use crate::planner::plan;

/// The latest (configuration, state) delivered by the control service.
#[derive(Debug, Clone)]
pub struct ClusterUpdate {
    pub configuration: Deployment,
    pub state: DeploymentState,
    pub trace_id: String,
}

pub struct ConvergenceLoop {
    observer: Observer,
    executor: Executor,
    updates: mpsc::Receiver<ClusterUpdate>,
    outbound: mpsc::UnboundedSender<Message>,
    interval: Duration,
}

impl ConvergenceLoop {
    pub fn new(
        observer: Observer,
        executor: Executor,
        updates: mpsc::Receiver<ClusterUpdate>,
        outbound: mpsc::UnboundedSender<Message>,
        interval: Duration,
    ) -> Self {
        ConvergenceLoop {
            observer,
            executor,
            updates,
            outbound,
            interval,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut target: Option<ClusterUpdate> = None;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                update = self.updates.recv() => {
                    match update {
                        Some(update) => {
                            debug!(trace_id = %update.trace_id, "cluster updated");
                            target = Some(update);
                        }
                        None => {
                            info!("update channel closed, stopping convergence loop");
                            return;
                        }
                    }
                }
            }
            if let Err(e) = self.step(target.as_ref()).await {
                warn!(error = %e, "convergence step failed, retrying on next tick");
            }
        }
    }

    /// One pass: observe, publish, plan, execute at most one action.
    async fn step(&self, target: Option<&ClusterUpdate>) -> Result<()> {
        let observation = self.observer.observe().await?;
        let trace_id = target
            .map(|t| t.trace_id.clone())
            .unwrap_or_else(new_trace_id);

        // Publishing may race a reconnect; the next round resends anyway.
        let _ = self.outbound.send(Message::NodeState {
            changes: observation.changes(),
            trace_id: trace_id.clone(),
        });

        let Some(target) = target else {
            return Ok(());
        };

        let Some(action) = plan(
            &target.configuration,
            &target.state,
            &observation.node_state,
            &observation.volumes,
            &observation.instance_id,
        ) else {
            debug!(%trace_id, "converged, nothing to do");
            return Ok(());
        };

        info!(%trace_id, ?action, "executing convergence action");
        match self
            .executor
            .execute(&action, &observation, &target.configuration, &target.state)
            .await
        {
            Ok(()) => {
                // Re-observe immediately so the control service learns the
                // outcome without waiting a full tick.
                let after = self.observer.observe().await?;
                let _ = self.outbound.send(Message::NodeState {
                    changes: after.changes(),
                    trace_id,
                });
            }
            Err(e) => {
                let transient = e
                    .downcast_ref::<VolumeError>()
                    .map(VolumeError::is_transient)
                    .unwrap_or(true);
                if transient {
                    warn!(%trace_id, ?action, error = %e, "action failed, will retry");
                } else {
                    error!(%trace_id, ?action, error = %e, "action failed, attention required");
                }
            }
        }
        Ok(())
    }
}
