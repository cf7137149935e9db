//! TaskProxy: one instance of a task at one cycle point in one flow, and its
//! job lifecycle state machine.
//!
//! Grounded in `knhk-workflow-engine/src/case.rs` — match-on-current-state
//! transition methods, each returning `SchedulerResult<()>` and erroring with
//! `InvalidStateTransition { from, to }` rather than panicking.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cycle::{CyclePoint, Interval};
use crate::error::{SchedulerError, SchedulerResult};
use crate::prerequisite::Prerequisite;

/// `(task name, cycle point, flow tag)` — a TaskProxy's identity. Two
/// proxies with the same name/cycle but different flow tags are distinct
/// instances (a "re-flow" triggered from an earlier point in the graph).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyId {
    pub name: String,
    pub cycle: CyclePoint,
    pub flow_tag: u64,
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.name, self.cycle, self.flow_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Waiting,
    Queued,
    Preparing,
    Submitted,
    SubmitFailed,
    SubmitRetrying,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Expired,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::SubmitFailed | TaskStatus::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Preparing | TaskStatus::Submitted | TaskStatus::Running
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Queued => "queued",
            TaskStatus::Preparing => "preparing",
            TaskStatus::Submitted => "submitted",
            TaskStatus::SubmitFailed => "submit-failed",
            TaskStatus::SubmitRetrying => "submit-retrying",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Last-delay-repeats-forever lookup, grounded in
/// `original_source/lib/cylc/poll_timer.py`: index into the delay list,
/// clamped to the final entry once exhausted.
pub fn nth_delay(delays: &[Interval], attempt: u32) -> Option<Interval> {
    if delays.is_empty() {
        return None;
    }
    let idx = (attempt as usize).min(delays.len() - 1);
    Some(delays[idx])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProxy {
    pub id: ProxyId,
    pub status: TaskStatus,
    pub held: bool,
    pub prerequisites: Prerequisite,
    /// This proxy's own outputs that have fired, keyed by output name to the
    /// completer id recorded for downstream prerequisites (normally its own
    /// `ProxyId::to_string()`, but kept explicit for message replay).
    pub outputs: HashMap<String, String>,
    pub submit_num: u32,
    /// 1-based count of the attempt currently in flight or most recently
    /// made; shared between execution and submission retries, matching
    /// cylc's own `try_num` bookkeeping.
    pub try_num: u32,
    pub job_id: Option<String>,
    pub retry_delays: Vec<Interval>,
    pub submit_retry_delays: Vec<Interval>,
    /// Xtriggers this proxy's `prepare_submit` additionally gates on (spec.md
    /// §4.3), resolved once from the `TaskDefinition` at creation.
    pub xtrigger_requirements: Vec<crate::xtrigger::XtriggerRequirement>,
    xtriggers_fired: Vec<bool>,
    /// When a `retrying`/`submit-retrying` proxy becomes eligible for its
    /// next `prepare_submit`. Not persisted: a restart re-admits immediately
    /// rather than trying to recover a wall-clock deadline across a gap of
    /// unknown length.
    #[serde(skip)]
    retry_due: Option<std::time::Instant>,
}

impl TaskProxy {
    pub fn new(id: ProxyId, prerequisites: Prerequisite) -> Self {
        TaskProxy::new_with_xtriggers(id, prerequisites, Vec::new())
    }

    pub fn new_with_xtriggers(
        id: ProxyId,
        prerequisites: Prerequisite,
        xtrigger_requirements: Vec<crate::xtrigger::XtriggerRequirement>,
    ) -> Self {
        let xtriggers_fired = vec![false; xtrigger_requirements.len()];
        let status = if prerequisites.all_satisfied() && xtriggers_fired.iter().all(|&f| f) {
            TaskStatus::Queued
        } else {
            TaskStatus::Waiting
        };
        TaskProxy {
            id,
            status,
            held: false,
            prerequisites,
            outputs: HashMap::new(),
            submit_num: 0,
            try_num: 1,
            job_id: None,
            retry_delays: Vec::new(),
            submit_retry_delays: Vec::new(),
            xtrigger_requirements,
            xtriggers_fired,
            retry_due: None,
        }
    }

    /// Whether a `retrying`/`submit-retrying` proxy's delay has elapsed and
    /// it may be re-admitted to submission. Any other status reads `false`
    /// here; `ready_for_submission` already filters those separately.
    pub fn retry_is_due(&self) -> bool {
        match self.status {
            TaskStatus::Retrying | TaskStatus::SubmitRetrying => {
                self.retry_due.map(|due| std::time::Instant::now() >= due).unwrap_or(true)
            }
            _ => false,
        }
    }

    /// True once every xtrigger this proxy depends on has fired (vacuously
    /// true if it has none).
    pub fn xtriggers_satisfied(&self) -> bool {
        self.xtriggers_fired.iter().all(|&f| f)
    }

    /// Whether requirement `idx` has already fired. Out-of-range indices are
    /// treated as already satisfied so a stale index never blocks progress.
    pub fn xtrigger_fired(&self, idx: usize) -> bool {
        self.xtriggers_fired.get(idx).copied().unwrap_or(true)
    }

    /// Record that xtrigger `idx` has fired; moves Waiting -> Queued if that
    /// was the last thing blocking this proxy.
    pub fn fire_xtrigger(&mut self, idx: usize) {
        if let Some(slot) = self.xtriggers_fired.get_mut(idx) {
            *slot = true;
        }
        if self.status == TaskStatus::Waiting && self.prerequisites.all_satisfied() && self.xtriggers_satisfied() {
            self.status = TaskStatus::Queued;
        }
    }

    fn transition_error(&self, to: TaskStatus) -> SchedulerError {
        SchedulerError::InvalidStateTransition {
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Feed a satisfied upstream output into this proxy's prerequisites. If
    /// that completes the prerequisite set, move Waiting -> Queued.
    pub fn satisfy(&mut self, task_name: &str, point: &CyclePoint, output: &str, completer_id: &str) -> bool {
        let matched = self.prerequisites.satisfy(task_name, point, output, completer_id);
        if matched && self.status == TaskStatus::Waiting && self.prerequisites.all_satisfied() && self.xtriggers_satisfied() {
            self.status = TaskStatus::Queued;
        }
        matched
    }

    /// Consume a queue slot and begin job preparation.
    pub fn prepare_submit(&mut self) -> SchedulerResult<()> {
        match self.status {
            TaskStatus::Queued => {
                self.submit_num += 1;
                self.status = TaskStatus::Preparing;
                self.retry_due = None;
                Ok(())
            }
            TaskStatus::Retrying | TaskStatus::SubmitRetrying => {
                self.submit_num += 1;
                self.try_num += 1;
                self.status = TaskStatus::Preparing;
                self.retry_due = None;
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Preparing)),
        }
    }

    pub fn on_submit_result(&mut self, success: bool, job_id: Option<String>) -> SchedulerResult<()> {
        if self.status != TaskStatus::Preparing {
            return Err(self.transition_error(TaskStatus::Submitted));
        }
        if success {
            self.job_id = job_id;
            self.status = TaskStatus::Submitted;
            self.record_output("submitted");
            Ok(())
        } else if (self.try_num as usize) <= self.submit_retry_delays.len() {
            self.status = TaskStatus::SubmitRetrying;
            self.retry_due = nth_delay(&self.submit_retry_delays, self.try_num - 1).map(|d| std::time::Instant::now() + d.as_duration());
            Ok(())
        } else {
            self.status = TaskStatus::SubmitFailed;
            self.record_output("submit-failed");
            Ok(())
        }
    }

    fn record_output(&mut self, output: &str) {
        self.outputs.insert(output.to_string(), self.id.to_string());
    }

    /// `succeeded` implies `submitted` and `started` (spec §4.2/§4.8): a job
    /// that reported success obviously ran, even if the intermediate message
    /// was lost in transit. Back-fill whichever of the two are still missing
    /// before completing `succeeded` itself.
    fn record_succeeded(&mut self) {
        if !self.outputs.contains_key("submitted") {
            self.record_output("submitted");
        }
        if !self.outputs.contains_key("started") {
            self.record_output("started");
        }
        self.record_output("succeeded");
    }

    /// Apply an inbound job message. `msg_submit_num` ties the message to the
    /// submission that emitted it; messages from a stale submission are
    /// dropped except a late `succeeded`, which cylc still honours so a slow
    /// message doesn't turn a completed job into a false failure. Messages
    /// arriving after the proxy is already terminal are accepted only if
    /// idempotent with the existing terminal state.
    pub fn on_message(&mut self, msg_submit_num: u32, output: &str) -> SchedulerResult<bool> {
        if msg_submit_num < self.submit_num && output != "succeeded" {
            return Ok(false);
        }
        if self.status.is_terminal() {
            return Ok(output == "succeeded" && self.status == TaskStatus::Succeeded);
        }
        match output {
            "started" => {
                if self.status == TaskStatus::Submitted {
                    self.status = TaskStatus::Running;
                }
                self.record_output("started");
                Ok(true)
            }
            "succeeded" => {
                self.status = TaskStatus::Succeeded;
                self.record_succeeded();
                Ok(true)
            }
            "failed" => {
                if (self.try_num as usize) <= self.retry_delays.len() {
                    self.status = TaskStatus::Retrying;
                    self.retry_due = nth_delay(&self.retry_delays, self.try_num - 1).map(|d| std::time::Instant::now() + d.as_duration());
                } else {
                    self.status = TaskStatus::Failed;
                }
                self.record_output("failed");
                Ok(true)
            }
            custom => {
                self.record_output(custom);
                Ok(true)
            }
        }
    }

    /// Reconciliation after a poll, independent of the message stream: the
    /// job runner's own view of job state. Used to close the race where a
    /// poll lands before the submit acknowledgement is even recorded.
    pub fn on_poll_result(&mut self, observed: PolledJobState) -> SchedulerResult<()> {
        match (self.status, observed) {
            (TaskStatus::Submitted, PolledJobState::Running) => {
                self.status = TaskStatus::Running;
                Ok(())
            }
            (TaskStatus::Running, PolledJobState::Succeeded) => {
                self.status = TaskStatus::Succeeded;
                self.record_succeeded();
                Ok(())
            }
            (TaskStatus::Running, PolledJobState::Failed) => {
                if (self.try_num as usize) <= self.retry_delays.len() {
                    self.status = TaskStatus::Retrying;
                    self.retry_due = nth_delay(&self.retry_delays, self.try_num - 1).map(|d| std::time::Instant::now() + d.as_duration());
                } else {
                    self.status = TaskStatus::Failed;
                }
                self.record_output("failed");
                Ok(())
            }
            // A poll finding nothing while we believe the job is live is a
            // race with the submission itself settling — not an error here;
            // the caller applies a grace window before treating it as loss.
            (_, PolledJobState::NotFound) => Ok(()),
            (current, _) if current.is_terminal() => Ok(()),
            _ => Ok(()),
        }
    }

    pub fn hold(&mut self) {
        self.held = true;
    }

    pub fn release(&mut self) {
        self.held = false;
    }

    pub fn kill(&mut self) -> SchedulerResult<()> {
        if self.status.is_active() {
            Ok(())
        } else {
            Err(SchedulerError::Command(format!(
                "cannot kill {} in status {}",
                self.id, self.status
            )))
        }
    }

    /// Force past prerequisite checks straight to queued, ignoring `held`.
    pub fn trigger(&mut self) -> SchedulerResult<()> {
        match self.status {
            TaskStatus::Waiting | TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Expired => {
                self.status = TaskStatus::Queued;
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Queued)),
        }
    }

    pub fn reset_outputs(&mut self) {
        self.outputs.clear();
    }

    pub fn expire(&mut self) -> SchedulerResult<()> {
        match self.status {
            TaskStatus::Waiting | TaskStatus::Queued => {
                self.status = TaskStatus::Expired;
                self.record_output("expired");
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Expired)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolledJobState {
    Running,
    Succeeded,
    Failed,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prerequisite::OutputValidator;

    struct AllKnown;
    impl OutputValidator for AllKnown {
        fn task_exists(&self, _: &str) -> bool {
            true
        }
        fn output_exists(&self, _: &str, _: &str) -> bool {
            true
        }
    }

    fn new_proxy() -> TaskProxy {
        let p = CyclePoint::integer(1);
        let prereq = Prerequisite::parse("", &p, None, &AllKnown).unwrap();
        TaskProxy::new(
            ProxyId {
                name: "foo".into(),
                cycle: p,
                flow_tag: 1,
            },
            prereq,
        )
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut t = new_proxy();
        assert_eq!(t.status, TaskStatus::Queued);
        t.prepare_submit().unwrap();
        assert_eq!(t.status, TaskStatus::Preparing);
        t.on_submit_result(true, Some("12345".into())).unwrap();
        assert_eq!(t.status, TaskStatus::Submitted);
        t.on_message(t.submit_num, "started").unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        t.on_message(t.submit_num, "succeeded").unwrap();
        assert_eq!(t.status, TaskStatus::Succeeded);
    }

    #[test]
    fn failure_then_retry_then_failed() {
        let mut t = new_proxy();
        t.retry_delays = vec![Interval::Integer(60)];
        t.prepare_submit().unwrap();
        t.on_submit_result(true, None).unwrap();
        t.on_message(t.submit_num, "started").unwrap();
        t.on_message(t.submit_num, "failed").unwrap();
        assert_eq!(t.status, TaskStatus::Retrying);
        t.prepare_submit().unwrap();
        t.on_submit_result(true, None).unwrap();
        t.on_message(t.submit_num, "started").unwrap();
        t.on_message(t.submit_num, "failed").unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn stale_message_is_rejected() {
        let mut t = new_proxy();
        t.prepare_submit().unwrap();
        t.on_submit_result(true, None).unwrap();
        let accepted = t.on_message(0, "started").unwrap();
        assert!(!accepted);
        assert_eq!(t.status, TaskStatus::Submitted);
    }

    #[test]
    fn late_succeeded_after_terminal_is_idempotent() {
        let mut t = new_proxy();
        t.prepare_submit().unwrap();
        t.on_submit_result(true, None).unwrap();
        t.on_message(t.submit_num, "started").unwrap();
        t.on_message(t.submit_num, "succeeded").unwrap();
        let accepted = t.on_message(t.submit_num, "succeeded").unwrap();
        assert!(accepted);
        assert_eq!(t.status, TaskStatus::Succeeded);
    }

    #[test]
    fn kill_only_valid_while_active() {
        let mut t = new_proxy();
        assert!(t.kill().is_err());
        t.prepare_submit().unwrap();
        assert!(t.kill().is_ok());
    }

    #[test]
    fn retry_is_due_once_delay_elapses() {
        let mut t = new_proxy();
        t.retry_delays = vec![Interval::Integer(0)];
        t.prepare_submit().unwrap();
        t.on_submit_result(true, None).unwrap();
        t.on_message(t.submit_num, "failed").unwrap();
        assert_eq!(t.status, TaskStatus::Retrying);
        assert!(t.retry_is_due());
    }

    #[test]
    fn held_is_orthogonal_to_status() {
        let mut t = new_proxy();
        t.hold();
        assert!(t.held);
        assert_eq!(t.status, TaskStatus::Queued);
    }
}
