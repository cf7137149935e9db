//! Command/Query surface: the operator-facing API a CLI or UI drives the
//! scheduler through. Interface-only collaborators (CLI parsing, HTTP/ZMQ
//! transport) are out of scope per spec.md §1 — this module is the surface
//! those transports would call into.
//!
//! Grounded in `knhk-workflow-engine/src/executor.rs`'s public async
//! methods (`create_case`, `cancel_case`, ...), each validating its target
//! exists before mutating it and returning `WorkflowResult<()>`.

use serde::{Deserialize, Serialize};

use crate::broadcast::{CycleScope, Namespace};
use crate::cycle::CyclePoint;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::Scheduler;
use crate::task_proxy::ProxyId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSummary {
    pub id: String,
    pub status: String,
    pub held: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub proxies: Vec<StateSummary>,
    pub stalled: bool,
}

impl Scheduler {
    pub fn cmd_hold(&mut self, id: &ProxyId) -> SchedulerResult<()> {
        self.pool_mut()
            .get_mut(id)
            .ok_or_else(|| SchedulerError::ProxyNotFound(id.to_string()))?
            .hold();
        Ok(())
    }

    pub fn cmd_release(&mut self, id: &ProxyId) -> SchedulerResult<()> {
        self.pool_mut()
            .get_mut(id)
            .ok_or_else(|| SchedulerError::ProxyNotFound(id.to_string()))?
            .release();
        Ok(())
    }

    pub fn cmd_trigger(&mut self, id: &ProxyId) -> SchedulerResult<()> {
        self.pool_mut()
            .get_mut(id)
            .ok_or_else(|| SchedulerError::ProxyNotFound(id.to_string()))?
            .trigger()
    }

    pub fn cmd_kill(&mut self, id: &ProxyId) -> SchedulerResult<()> {
        self.pool_mut()
            .get_mut(id)
            .ok_or_else(|| SchedulerError::ProxyNotFound(id.to_string()))?
            .kill()
    }

    pub fn cmd_remove(&mut self, id: &ProxyId) -> SchedulerResult<()> {
        self.pool_mut()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::ProxyNotFound(id.to_string()))
    }

    pub fn cmd_insert(&mut self, task_name: &str, cycle: CyclePoint, flow_tag: u64) -> SchedulerResult<ProxyId> {
        self.pool_mut()
            .spawn(task_name, cycle, flow_tag)?
            .ok_or_else(|| SchedulerError::Command(format!("{task_name}.{cycle} already exists or is beyond runahead")))
    }

    pub fn cmd_reset_outputs(&mut self, id: &ProxyId) -> SchedulerResult<()> {
        self.pool_mut()
            .get_mut(id)
            .ok_or_else(|| SchedulerError::ProxyNotFound(id.to_string()))?
            .reset_outputs();
        Ok(())
    }

    pub fn cmd_pause(&mut self) {
        self.pause();
    }

    pub fn cmd_resume(&mut self) {
        self.resume();
    }

    pub fn cmd_stop(&mut self) {
        self.request_stop();
    }

    pub fn cmd_set_hold_point(&mut self, cycle: CyclePoint) {
        self.pool_mut().set_hold_point(cycle);
    }

    pub fn cmd_release_hold_point(&mut self) {
        self.pool_mut().release_hold_point();
    }

    pub fn cmd_broadcast_put(&mut self, cycle: CycleScope, namespace: Namespace, setting: &str, value: &str) {
        self.broadcast_mut().put(cycle, namespace, setting, value);
    }

    pub fn cmd_broadcast_clear(&mut self, cycle: Option<&CycleScope>, namespace: Option<&Namespace>, setting: Option<&str>) -> usize {
        self.broadcast_mut().clear(cycle, namespace, setting)
    }

    pub fn query_state_summary(&self) -> Vec<StateSummary> {
        self.pool()
            .iter()
            .map(|p| StateSummary {
                id: p.id.to_string(),
                status: p.status.to_string(),
                held: p.held,
            })
            .collect()
    }

    pub fn query_graph_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            proxies: self.query_state_summary(),
            stalled: self.pool().is_stalled(),
        }
    }
}
