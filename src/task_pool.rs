//! TaskPool: the live collection of TaskProxies for a running suite —
//! spawning, queue admission, runahead enforcement, and retirement.
//!
//! Grounded in `knhk-workflow-engine/src/executor.rs`'s
//! `Arc<RwLock<HashMap<CaseId, Case>>>` registry idiom (here synchronous —
//! the pool is owned exclusively by the scheduler's single-threaded tick)
//! and in `src/state.rs` for the persistence calls it makes on mutation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cycle::{CyclePoint, Interval};
use crate::error::SchedulerResult;
use crate::prerequisite::Prerequisite;
use crate::task_def::TaskDefinitionSet;
use crate::task_proxy::{ProxyId, TaskProxy, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub members: Vec<String>,
    pub limit: usize,
}

pub struct TaskPool {
    proxies: HashMap<ProxyId, TaskProxy>,
    defs: TaskDefinitionSet,
    icp: CyclePoint,
    runahead_limit: Interval,
    queues: HashMap<String, QueueConfig>,
    default_queue_limit: usize,
    /// Pool-wide hold after a cycle point (spec.md §4.10 `set_hold_point`):
    /// no proxy whose cycle is strictly after this point may submit, whether
    /// or not it is individually `held`.
    hold_point: Option<CyclePoint>,
}

impl TaskPool {
    pub fn new(defs: TaskDefinitionSet, icp: CyclePoint, runahead_limit: Interval) -> Self {
        TaskPool {
            proxies: HashMap::new(),
            defs,
            icp,
            runahead_limit,
            queues: HashMap::new(),
            default_queue_limit: usize::MAX,
            hold_point: None,
        }
    }

    /// `set_hold_point(cycle)`: no proxy past `cycle` may submit until
    /// `release_hold_point` is called.
    pub fn set_hold_point(&mut self, point: CyclePoint) {
        self.hold_point = Some(point);
    }

    pub fn release_hold_point(&mut self) {
        self.hold_point = None;
    }

    pub fn hold_point(&self) -> Option<&CyclePoint> {
        self.hold_point.as_ref()
    }

    fn past_hold_point(&self, cycle: &CyclePoint) -> bool {
        match &self.hold_point {
            None => false,
            Some(hp) => cycle.compare(hp).map(|o| o == std::cmp::Ordering::Greater).unwrap_or(false),
        }
    }

    pub fn set_queues(&mut self, queues: HashMap<String, QueueConfig>, default_limit: usize) {
        self.queues = queues;
        self.default_queue_limit = default_limit;
    }

    pub fn get(&self, id: &ProxyId) -> Option<&TaskProxy> {
        self.proxies.get(id)
    }

    pub fn get_mut(&mut self, id: &ProxyId) -> Option<&mut TaskProxy> {
        self.proxies.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskProxy> {
        self.proxies.values()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Reinsert a proxy loaded verbatim from the `Store` (spec.md §6
    /// restart sequence: "pool is rebuilt from Store"), bypassing `spawn`'s
    /// prerequisite-(re)parsing and runahead check entirely — the proxy
    /// already carries its own resolved `prerequisites`/`outputs`/status
    /// from before the crash. Overwrites any existing entry with the same
    /// id.
    pub fn restore_proxy(&mut self, proxy: TaskProxy) {
        info!(task = %proxy.id, status = %proxy.status, "restored task proxy from store");
        self.proxies.insert(proxy.id.clone(), proxy);
    }

    /// Create a TaskProxy for `(name, cycle, flow_tag)` if it doesn't
    /// already exist and the cycle point is within the runahead window.
    pub fn spawn(&mut self, name: &str, cycle: CyclePoint, flow_tag: u64) -> SchedulerResult<Option<ProxyId>> {
        let id = ProxyId {
            name: name.to_string(),
            cycle,
            flow_tag,
        };
        if self.proxies.contains_key(&id) {
            return Ok(None);
        }
        if !self.within_runahead(&cycle)? {
            debug!(task = %name, cycle = %cycle, "not spawning: beyond runahead limit");
            return Ok(None);
        }
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| crate::error::SchedulerError::UnknownTask(name.to_string()))?;
        let mut prereq = Prerequisite::parse(&def.dependencies, &cycle, Some(&self.icp), &self.defs)?;
        // A dependency may have already completed before this proxy ever
        // existed (spawn-on-demand lags output completion by one step);
        // back-fill from every already-recorded output rather than relying
        // solely on future `on_output` calls to satisfy it.
        for other in self.proxies.values() {
            for (output, completer) in &other.outputs {
                prereq.satisfy(&other.id.name, &other.id.cycle, output, completer);
            }
        }
        let mut proxy = TaskProxy::new_with_xtriggers(id.clone(), prereq, def.xtriggers.clone());
        proxy.retry_delays = def.retry_delays.clone();
        proxy.submit_retry_delays = def.submit_retry_delays.clone();
        info!(task = %name, cycle = %cycle, flow = flow_tag, "spawned task proxy");
        self.proxies.insert(id.clone(), proxy);
        Ok(Some(id))
    }

    /// Spawn the first occurrence of every task whose dependency
    /// expression is empty — the graph's entry points. A real deployment's
    /// graph-language parser would instead derive these from the absence
    /// of inbound edges; with no parser in the core (spec.md §1), an empty
    /// dependency string is the signal.
    pub fn seed_initial(&mut self, flow_tag: u64) -> SchedulerResult<Vec<ProxyId>> {
        let names: Vec<String> = self
            .defs
            .names()
            .filter(|n| self.defs.get(n).map(|d| d.dependencies.trim().is_empty()).unwrap_or(false))
            .map(|n| n.to_string())
            .collect();
        let mut spawned = Vec::new();
        for name in names {
            let sequences = self.defs.get(&name).map(|d| d.sequences.clone()).unwrap_or_default();
            for seq in sequences {
                if let Some(point) = seq.first_on_or_after(&self.icp)? {
                    if let Some(id) = self.spawn(&name, point, flow_tag)? {
                        spawned.push(id);
                    }
                }
            }
        }
        Ok(spawned)
    }

    /// Proxies still `Waiting` on at least one unfired xtrigger — the set
    /// the scheduler's per-tick xtrigger evaluation step needs to visit.
    pub fn proxies_with_pending_xtriggers(&self) -> Vec<ProxyId> {
        self.proxies
            .values()
            .filter(|p| p.status == TaskStatus::Waiting && !p.xtriggers_satisfied())
            .map(|p| p.id.clone())
            .collect()
    }

    fn within_runahead(&self, cycle: &CyclePoint) -> SchedulerResult<bool> {
        let active_floor = self
            .proxies
            .values()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.id.cycle)
            .reduce(|a, b| if a.compare(&b).unwrap_or(std::cmp::Ordering::Less) == std::cmp::Ordering::Less { a } else { b })
            .unwrap_or(self.icp);
        let bound = active_floor.add(&self.runahead_limit)?;
        Ok(cycle.compare(&bound)? != std::cmp::Ordering::Greater)
    }

    /// Record that `source`'s `output` has fired: satisfy any existing
    /// proxy's matching prerequisite atom, and spawn the next occurrence of
    /// every task definition so later-cycle dependents become reachable.
    ///
    /// "Next" is relative to the latest proxy already spawned for that task
    /// name, not the ICP — the sequence only ever advances, one occurrence
    /// per completed output, the way cylc's own spawn-on-demand works.
    pub fn on_output(&mut self, source: &ProxyId, output: &str) -> SchedulerResult<Vec<ProxyId>> {
        let completer = source.to_string();
        for proxy in self.proxies.values_mut() {
            proxy.satisfy(&source.name, &source.cycle, output, &completer);
        }

        let mut spawned = Vec::new();
        let names: Vec<String> = self.defs.names().map(|s| s.to_string()).collect();
        for name in names {
            let def = self.defs.get(&name).unwrap();
            let latest = self
                .proxies
                .keys()
                .filter(|id| id.name == name)
                .map(|id| id.cycle)
                .reduce(|a, b| if a.compare(&b).unwrap_or(std::cmp::Ordering::Less) == std::cmp::Ordering::Less { b } else { a });
            for seq in &def.sequences {
                let next = match latest {
                    Some(latest) => seq.next_after(&latest)?,
                    None => seq.first_on_or_after(&self.icp)?,
                };
                if let Some(next) = next {
                    if self.within_runahead(&next)? {
                        if let Some(id) = self.spawn(&name, next, source.flow_tag)? {
                            spawned.push(id);
                        }
                    }
                }
            }
        }
        Ok(spawned)
    }

    fn queue_for(&self, task_name: &str) -> &str {
        self.queues
            .iter()
            .find(|(_, cfg)| cfg.members.iter().any(|m| m == task_name))
            .map(|(name, _)| name.as_str())
            .unwrap_or("default")
    }

    fn queue_limit(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|c| c.limit).unwrap_or(self.default_queue_limit)
    }

    /// IDs of proxies eligible to move from Queued to Preparing this tick,
    /// respecting per-queue in-flight limits and excluding held proxies and
    /// any proxy past the pool-wide hold point.
    pub fn ready_for_submission(&self) -> Vec<ProxyId> {
        let mut in_flight: HashMap<&str, usize> = HashMap::new();
        for p in self.proxies.values() {
            if p.status.is_active() {
                *in_flight.entry(self.queue_for(&p.id.name)).or_insert(0) += 1;
            }
        }
        let mut candidates: Vec<&TaskProxy> = self
            .proxies
            .values()
            .filter(|p| {
                (p.status == TaskStatus::Queued || p.retry_is_due()) && !p.held && !self.past_hold_point(&p.id.cycle)
            })
            .collect();
        candidates.sort_by(|a, b| a.id.cycle.compare(&b.id.cycle).unwrap_or(std::cmp::Ordering::Equal).then(a.id.name.cmp(&b.id.name)));

        let mut ready = Vec::new();
        for p in candidates {
            let q = self.queue_for(&p.id.name);
            let limit = self.queue_limit(q);
            let used = in_flight.entry(q).or_insert(0);
            if *used < limit {
                *used += 1;
                ready.push(p.id.clone());
            }
        }
        ready
    }

    /// Remove terminal proxies strictly older than the oldest still-active
    /// cycle point: nothing outstanding can still reference them.
    pub fn retire_completed(&mut self) -> SchedulerResult<Vec<ProxyId>> {
        let floor = self
            .proxies
            .values()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.id.cycle)
            .reduce(|a, b| if a.compare(&b).unwrap_or(std::cmp::Ordering::Greater) == std::cmp::Ordering::Less { a } else { b });

        let Some(floor) = floor else {
            // nothing active: retire everything terminal.
            let retired: Vec<ProxyId> = self
                .proxies
                .iter()
                .filter(|(_, p)| p.status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &retired {
                self.proxies.remove(id);
            }
            return Ok(retired);
        };

        let mut retired = Vec::new();
        let ids: Vec<ProxyId> = self.proxies.keys().cloned().collect();
        for id in ids {
            let proxy = &self.proxies[&id];
            if proxy.status.is_terminal() && id.cycle.compare(&floor)? == std::cmp::Ordering::Less {
                self.proxies.remove(&id);
                retired.push(id);
            }
        }
        Ok(retired)
    }

    pub fn remove(&mut self, id: &ProxyId) -> Option<TaskProxy> {
        self.proxies.remove(id)
    }

    /// True if nothing can make progress: no proxy active, queued, or
    /// waiting on a retry timer; no proxy waiting on an xtrigger that might
    /// still fire; yet at least one is still waiting on something that will
    /// never come.
    pub fn is_stalled(&self) -> bool {
        let any_active = self.proxies.values().any(|p| {
            p.status.is_active()
                || p.status == TaskStatus::Queued
                || p.status == TaskStatus::Retrying
                || p.status == TaskStatus::SubmitRetrying
        });
        let any_xtrigger_outstanding = !self.proxies_with_pending_xtriggers().is_empty();
        let any_waiting = self.proxies.values().any(|p| p.status == TaskStatus::Waiting);
        !any_active && !any_xtrigger_outstanding && any_waiting
    }

    /// True once every proxy is terminal and nothing new can spawn.
    pub fn should_shut_down(&self) -> bool {
        !self.proxies.is_empty() && self.proxies.values().all(|p| p.status.is_terminal())
    }

    /// Swap in a new TaskDefinitionSet (e.g. after `cylc reload`), keeping
    /// the state of every live proxy untouched; only future spawns and
    /// re-parsed prerequisites see the new definitions.
    pub fn reload_definitions(&mut self, defs: TaskDefinitionSet) {
        warn!(
            task_count = defs.names().count(),
            "reloading task definitions; live proxies retain their current state"
        );
        self.defs = defs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_def::TaskDefinition;

    fn pool_with_single_task() -> TaskPool {
        let icp = CyclePoint::integer(1);
        let seq = crate::sequence::Sequence::parse("R/P1", &icp).unwrap();
        let mut defs = TaskDefinitionSet::new();
        defs.insert(TaskDefinition::new("foo", vec![seq], ""));
        TaskPool::new(defs, icp, Interval::Integer(3))
    }

    #[test]
    fn spawn_is_idempotent() {
        let mut pool = pool_with_single_task();
        let first = pool.spawn("foo", CyclePoint::integer(1), 1).unwrap();
        assert!(first.is_some());
        let second = pool.spawn("foo", CyclePoint::integer(1), 1).unwrap();
        assert!(second.is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn runahead_limit_blocks_far_future_spawn() {
        let mut pool = pool_with_single_task();
        pool.spawn("foo", CyclePoint::integer(1), 1).unwrap();
        let blocked = pool.spawn("foo", CyclePoint::integer(10), 1).unwrap();
        assert!(blocked.is_none());
    }

    #[test]
    fn queue_limit_caps_concurrent_submission() {
        let mut pool = pool_with_single_task();
        pool.spawn("foo", CyclePoint::integer(1), 1).unwrap();
        pool.spawn("foo", CyclePoint::integer(2), 1).unwrap();
        pool.set_queues(
            HashMap::from([(
                "default".to_string(),
                QueueConfig {
                    members: vec!["foo".to_string()],
                    limit: 1,
                },
            )]),
            1,
        );
        let ready = pool.ready_for_submission();
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn held_proxies_are_excluded_from_submission() {
        let mut pool = pool_with_single_task();
        let id = pool.spawn("foo", CyclePoint::integer(1), 1).unwrap().unwrap();
        pool.get_mut(&id).unwrap().hold();
        assert!(pool.ready_for_submission().is_empty());
    }

    #[test]
    fn retrying_proxy_is_readmitted_once_due() {
        let mut pool = pool_with_single_task();
        let id = pool.spawn("foo", CyclePoint::integer(1), 1).unwrap().unwrap();
        let proxy = pool.get_mut(&id).unwrap();
        proxy.retry_delays = vec![Interval::Integer(0)];
        proxy.prepare_submit().unwrap();
        proxy.on_submit_result(true, None).unwrap();
        proxy.on_message(proxy.submit_num, "failed").unwrap();
        assert_eq!(pool.ready_for_submission(), vec![id]);
    }

    #[test]
    fn spawn_backfills_prerequisites_from_outputs_already_recorded() {
        let icp = CyclePoint::integer(1);
        let seq = crate::sequence::Sequence::parse("R/P1", &icp).unwrap();
        let mut defs = TaskDefinitionSet::new();
        defs.insert(TaskDefinition::new("a", vec![seq.clone()], ""));
        defs.insert(TaskDefinition::new("b", vec![seq], "a:succeeded"));
        let mut pool = TaskPool::new(defs, icp, Interval::Integer(10));
        let a = pool.spawn("a", CyclePoint::integer(1), 1).unwrap().unwrap();
        pool.get_mut(&a).unwrap().prepare_submit().unwrap();
        pool.get_mut(&a).unwrap().on_submit_result(true, None).unwrap();
        pool.get_mut(&a).unwrap().on_message(1, "succeeded").unwrap();

        let b = pool.spawn("b", CyclePoint::integer(1), 1).unwrap().unwrap();
        assert_eq!(pool.get(&b).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn on_output_advances_past_the_first_cycle_point() {
        let icp = CyclePoint::integer(1);
        let seq = crate::sequence::Sequence::parse("R/P1", &icp).unwrap();
        let mut defs = TaskDefinitionSet::new();
        defs.insert(TaskDefinition::new("foo", vec![seq], ""));
        let mut pool = TaskPool::new(defs, icp, Interval::Integer(10));
        let first = pool.spawn("foo", CyclePoint::integer(1), 1).unwrap().unwrap();
        pool.on_output(&first, "succeeded").unwrap();
        assert!(pool.get(&ProxyId {
            name: "foo".into(),
            cycle: CyclePoint::integer(2),
            flow_tag: 1
        })
        .is_some());
    }

    #[test]
    fn stall_detected_when_nothing_can_progress() {
        let icp = CyclePoint::integer(1);
        let seq = crate::sequence::Sequence::parse("R/P1", &icp).unwrap();
        let mut defs = TaskDefinitionSet::new();
        defs.insert(TaskDefinition::new("a", vec![seq.clone()], ""));
        defs.insert(TaskDefinition::new("b", vec![seq], "a:succeeded"));
        let mut pool = TaskPool::new(defs, icp, Interval::Integer(3));
        pool.spawn("b", CyclePoint::integer(1), 1).unwrap();
        assert!(pool.is_stalled());
    }
}
