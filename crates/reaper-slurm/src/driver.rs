//! Node state driver — moves nodes through the suspend state machine.
//!
//! The driver tracks the phase of every node it has touched during a run
//! and refuses transitions outside
//! `Schedulable → AdminDown → PowerDown → Schedulable`
//! (plus `Schedulable → PowerDown` for idle-policy suspends).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use reaper_core::{Hostname, Trigger};

use crate::control::{NodeStateCommand, SchedulerControl};

/// Scheduler-visible phase of a node during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodePhase {
    Schedulable,
    /// Drained by an admin `down`; clears any pending power-up.
    AdminDown,
    PowerDown,
}

impl NodePhase {
    fn can_move_to(self, to: NodePhase) -> bool {
        matches!(
            (self, to),
            (NodePhase::Schedulable, NodePhase::AdminDown)
                | (NodePhase::Schedulable, NodePhase::PowerDown)
                | (NodePhase::AdminDown, NodePhase::PowerDown)
                | (NodePhase::PowerDown, NodePhase::Schedulable)
        )
    }
}

/// One recorded phase change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub hostname: Hostname,
    pub from: NodePhase,
    pub to: NodePhase,
}

pub struct NodeStateDriver {
    scheduler: Arc<dyn SchedulerControl>,
    phases: HashMap<Hostname, NodePhase>,
    history: Vec<Transition>,
}

impl NodeStateDriver {
    pub fn new(scheduler: Arc<dyn SchedulerControl>) -> Self {
        Self {
            scheduler,
            phases: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Current phase of a node. Untouched nodes are schedulable.
    pub fn phase(&self, hostname: &str) -> NodePhase {
        self.phases
            .get(hostname)
            .copied()
            .unwrap_or(NodePhase::Schedulable)
    }

    /// Every transition recorded so far, in order.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Take nodes out of service before their instances are deleted.
    ///
    /// A job-triggered suspend drains the nodes with `down` (which drops a
    /// pending power-up left by a failed prolog) and then issues
    /// `power_down`. A phase is only recorded once its command succeeded,
    /// so nodes the scheduler never powered down are not resumed later.
    /// An idle-triggered suspend issues nothing: the
    /// scheduler's idle policy already powered the nodes down.
    pub async fn take_offline(&mut self, expr: &str, hostnames: &[Hostname], trigger: Trigger) {
        match trigger {
            Trigger::JobCompletion(job_id) => {
                let reason = format!("{job_id} finishing");
                if self.issue(expr, NodeStateCommand::Down, Some(reason.as_str())).await {
                    self.advance_all(hostnames, NodePhase::AdminDown);
                } else {
                    warn!(job_id, nodes = expr, "nodes not drained; continuing with power_down");
                }

                if !self.issue(expr, NodeStateCommand::PowerDown, None).await {
                    warn!(job_id, nodes = expr, "nodes not powered down; they will not be resumed");
                    return;
                }
                self.advance_all(hostnames, NodePhase::PowerDown);
                info!(job_id, nodes = hostnames.len(), "nodes drained and powering down");
            }
            Trigger::Idle => {
                self.advance_all(hostnames, NodePhase::PowerDown);
                debug!(nodes = hostnames.len(), "nodes already powering down by idle policy");
            }
        }
    }

    /// Return a node to service after its instance is confirmed gone.
    ///
    /// Only legal from `PowerDown`. Returns whether the node was resumed.
    pub async fn readmit(&mut self, hostname: &str) -> bool {
        if !self.phase(hostname).can_move_to(NodePhase::Schedulable) {
            warn!(
                node = hostname,
                phase = ?self.phase(hostname),
                "refusing to resume node that is not powered down"
            );
            return false;
        }
        if !self.issue(hostname, NodeStateCommand::Resume, None).await {
            return false;
        }
        self.advance(hostname, NodePhase::Schedulable);
        debug!(node = hostname, "node resumed");
        true
    }

    fn advance_all(&mut self, hostnames: &[Hostname], to: NodePhase) {
        for hostname in hostnames {
            self.advance(hostname, to);
        }
    }

    fn advance(&mut self, hostname: &str, to: NodePhase) -> bool {
        let from = self.phase(hostname);
        if !from.can_move_to(to) {
            warn!(node = hostname, ?from, ?to, "illegal node state transition refused");
            return false;
        }
        self.phases.insert(hostname.to_string(), to);
        self.history.push(Transition {
            hostname: hostname.to_string(),
            from,
            to,
        });
        true
    }

    /// Issue a state change; failures are logged, never propagated.
    async fn issue(&self, nodes: &str, state: NodeStateCommand, reason: Option<&str>) -> bool {
        match self.scheduler.update_nodes(nodes, state, reason).await {
            Ok(()) => true,
            Err(e) => {
                error!(nodes, state = state.as_str(), error = %e, "node state update failed");
                false
            }
        }
    }
}
