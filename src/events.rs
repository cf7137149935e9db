//! TaskEventsManager: message routing, poll reconciliation, and
//! timer-driven retry scheduling — the layer between raw job-runner/message
//! I/O and `TaskProxy` state transitions.
//!
//! Grounded in `knhk-workflow-engine/src/executor.rs`'s event routing
//! (`start_event_loop` draining an `mpsc::Receiver<serde_json::Value>`) and
//! in the crate's own `events.rs`, which maps domain events onto state
//! mutations rather than handling I/O directly.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::job_runner::PollGraceWindow;
use crate::task_proxy::{nth_delay, PolledJobState, ProxyId, TaskProxy, TaskStatus};

/// Severity carried on an inbound task message — maps onto tracing levels
/// per spec.md §4.8 (`DEBUG`->`trace!`, `INFO`->`info!`, `WARNING`->`warn!`,
/// `ERROR`/`CRITICAL`->`error!`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub proxy: ProxyId,
    pub submit_num: u32,
    pub severity: Severity,
    pub output: String,
}

/// Per-proxy retry/poll timers, keyed alongside the pool rather than inside
/// `TaskProxy` itself — timers are an events-manager concern, not core
/// lifecycle state.
#[derive(Default)]
struct ProxyTimers {
    next_poll_due: Option<Instant>,
    poll_attempt: u32,
    grace: Option<PollGraceWindow>,
}

pub struct TaskEventsManager {
    timers: HashMap<ProxyId, ProxyTimers>,
    execution_poll_delays: Vec<crate::cycle::Interval>,
}

impl TaskEventsManager {
    pub fn new(execution_poll_delays: Vec<crate::cycle::Interval>) -> Self {
        TaskEventsManager {
            timers: HashMap::new(),
            execution_poll_delays,
        }
    }

    fn log(severity: Severity, proxy: &ProxyId, output: &str) {
        match severity {
            Severity::Debug => debug!(task = %proxy, output, "task message"),
            Severity::Info => info!(task = %proxy, output, "task message"),
            Severity::Warning => warn!(task = %proxy, output, "task message"),
            Severity::Error | Severity::Critical => error!(task = %proxy, output, "task message"),
        }
    }

    /// Route one inbound message to its TaskProxy, rejecting messages for
    /// proxies the pool no longer knows about.
    pub fn handle_message(&mut self, proxy: &mut TaskProxy, msg: InboundMessage) -> SchedulerResult<bool> {
        if proxy.id != msg.proxy {
            return Err(SchedulerError::MessageRejected(format!(
                "message for {} delivered to proxy {}",
                msg.proxy, proxy.id
            )));
        }
        Self::log(msg.severity, &proxy.id, &msg.output);
        let accepted = proxy.on_message(msg.submit_num, &msg.output)?;
        if !accepted {
            warn!(task = %proxy.id, submit_num = msg.submit_num, current = proxy.submit_num, "message rejected as stale");
        }
        Ok(accepted)
    }

    /// Reconcile a poll result against the proxy's believed state, applying
    /// the grace window for a `NotFound` that may just be a submission race.
    pub fn handle_poll(&mut self, proxy: &mut TaskProxy, observed: PolledJobState) -> SchedulerResult<()> {
        let timers = self.timers.entry(proxy.id.clone()).or_default();
        let grace = timers.grace.get_or_insert_with(|| PollGraceWindow::new(std::time::Duration::from_secs(60)));
        if let Some(job_id) = &proxy.job_id {
            if observed == PolledJobState::Running {
                grace.record_submission(job_id);
            }
            match grace.reconcile(job_id, observed) {
                None => Ok(()),
                Some(resolved) => proxy.on_poll_result(resolved),
            }
        } else {
            proxy.on_poll_result(observed)
        }
    }

    /// Whether `proxy` is due for another submission-poll, using the
    /// exhaust-then-hold-last-interval backoff
    /// (`original_source/lib/cylc/poll_timer.py`).
    pub fn poll_due(&mut self, proxy: &TaskProxy, now: Instant) -> bool {
        if !proxy.status.is_active() {
            return false;
        }
        let timers = self.timers.entry(proxy.id.clone()).or_default();
        match timers.next_poll_due {
            None => true,
            Some(due) => now >= due,
        }
    }

    /// Record that a poll was just issued and schedule the next one.
    pub fn record_poll_issued(&mut self, proxy: &TaskProxy, now: Instant) {
        let timers = self.timers.entry(proxy.id.clone()).or_default();
        let delay = nth_delay(&self.execution_poll_delays, timers.poll_attempt);
        timers.poll_attempt += 1;
        timers.next_poll_due = delay.map(|d| now + d.as_duration());
    }

    pub fn forget(&mut self, id: &ProxyId) {
        self.timers.remove(id);
    }

    /// Failure semantics table (spec.md §4.8): what to do once a proxy has
    /// just transitioned into a terminal or retrying status after a message
    /// or poll. Returns the tracing-level summary line for operators.
    pub fn summarize_outcome(&self, proxy: &TaskProxy) -> String {
        match proxy.status {
            TaskStatus::Retrying => format!("{} failed, retry {} scheduled", proxy.id, proxy.try_num),
            TaskStatus::SubmitRetrying => format!("{} submit failed, retry {} scheduled", proxy.id, proxy.try_num),
            TaskStatus::Failed => format!("{} failed, no retries remaining", proxy.id),
            TaskStatus::SubmitFailed => format!("{} submit failed, no retries remaining", proxy.id),
            TaskStatus::Succeeded => format!("{} succeeded", proxy.id),
            other => format!("{} -> {}", proxy.id, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CyclePoint;
    use crate::prerequisite::{OutputValidator, Prerequisite};

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
    fn message_for_wrong_proxy_is_rejected() {
        let mut mgr = TaskEventsManager::new(Vec::new());
        let mut proxy = new_proxy();
        let msg = InboundMessage {
            proxy: ProxyId {
                name: "bar".into(),
                cycle: CyclePoint::integer(1),
                flow_tag: 1,
            },
            submit_num: 1,
            severity: Severity::Info,
            output: "started".into(),
        };
        assert!(mgr.handle_message(&mut proxy, msg).is_err());
    }

    #[test]
    fn message_routes_through_to_proxy() {
        let mut mgr = TaskEventsManager::new(Vec::new());
        let mut proxy = new_proxy();
        proxy.prepare_submit().unwrap();
        proxy.on_submit_result(true, None).unwrap();
        let msg = InboundMessage {
            proxy: proxy.id.clone(),
            submit_num: proxy.submit_num,
            severity: Severity::Info,
            output: "started".into(),
        };
        let accepted = mgr.handle_message(&mut proxy, msg).unwrap();
        assert!(accepted);
        assert_eq!(proxy.status, TaskStatus::Running);
    }

    #[test]
    fn poll_backoff_holds_last_interval_once_exhausted() {
        let mut mgr = TaskEventsManager::new(vec![crate::cycle::Interval::Integer(1), crate::cycle::Interval::Integer(2)]);
        let mut proxy = new_proxy();
        proxy.prepare_submit().unwrap();
        let t0 = Instant::now();
        mgr.record_poll_issued(&proxy, t0);
        mgr.record_poll_issued(&proxy, t0);
        mgr.record_poll_issued(&proxy, t0);
        let timers = mgr.timers.get(&proxy.id).unwrap();
        assert_eq!(timers.poll_attempt, 3);
    }
}
