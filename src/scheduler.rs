//! Scheduler: the cooperative single-threaded main loop tying every other
//! component together into one running suite.
//!
//! Grounded in `knhk-workflow-engine/src/engine/scheduler.rs` (a struct
//! wrapping shared counters/state behind `Arc`, exposing a stats snapshot)
//! and `src/executor.rs`'s event-loop wiring — generalized here from a
//! latency-budget tick loop into the suite tick: drain xtrigger results,
//! evaluate wall-clock/custom xtriggers, admit to queues, submit, poll,
//! retire, detect stalls, checkpoint. Message routing (`handle_message`) is
//! driven by the event queue outside `run_tick` rather than polled for.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broadcast::Broadcast;
use crate::config::SchedulerConfig;
use crate::cycle::{CyclePoint, Interval};
use crate::error::SchedulerResult;
use crate::events::{InboundMessage, Severity, TaskEventsManager};
use crate::job_runner::{JobRunnerRegistry, SubmitRequest};
use crate::store::Store;
use crate::task_def::TaskDefinitionSet;
use crate::task_pool::TaskPool;
use crate::task_proxy::{PolledJobState, ProxyId, TaskStatus};
use crate::xtrigger::{XtriggerManager, XtriggerRequirement};

/// Everything `Scheduler::new` needs, bundled explicitly rather than reached
/// for via module-level globals (spec.md §9 design note).
pub struct SchedulerContext {
    pub config: SchedulerConfig,
    pub defs: TaskDefinitionSet,
    pub icp: CyclePoint,
    pub runners: JobRunnerRegistry,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub submitted: usize,
    pub polled: usize,
    pub messages_handled: usize,
    pub retired: usize,
    pub stalled: bool,
    pub should_shut_down: bool,
}

pub struct Scheduler {
    config: SchedulerConfig,
    pool: TaskPool,
    broadcast: Broadcast,
    xtriggers: XtriggerManager,
    runners: JobRunnerRegistry,
    events: TaskEventsManager,
    store: Option<Store>,
    paused: bool,
    stop_requested: bool,
    tick_count: u64,
    last_checkpoint: Option<Instant>,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext) -> SchedulerResult<Self> {
        let runahead = Interval::parse(&ctx.config.runahead_limit)?;
        let mut pool = TaskPool::new(ctx.defs, ctx.icp, runahead);
        let queues = ctx
            .config
            .queues
            .iter()
            .map(|(name, q)| {
                (
                    name.clone(),
                    crate::task_pool::QueueConfig {
                        members: q.members.clone(),
                        limit: q.limit,
                    },
                )
            })
            .collect();
        pool.set_queues(queues, ctx.config.default_queue_limit);

        let store = match &ctx.config.store_path {
            Some(path) => Some(Store::open(path)?),
            None => None,
        };

        Ok(Scheduler {
            config: ctx.config,
            pool,
            broadcast: Broadcast::new(),
            xtriggers: XtriggerManager::new(),
            runners: ctx.runners,
            events: TaskEventsManager::new(Vec::new()),
            store,
            paused: false,
            stop_requested: false,
            tick_count: 0,
            last_checkpoint: None,
        })
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut TaskPool {
        &mut self.pool
    }

    pub fn broadcast_mut(&mut self) -> &mut Broadcast {
        &mut self.broadcast
    }

    pub fn xtriggers_mut(&mut self) -> &mut XtriggerManager {
        &mut self.xtriggers
    }

    pub fn pause(&mut self) {
        info!("scheduler paused");
        self.paused = true;
    }

    pub fn resume(&mut self) {
        info!("scheduler resumed");
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// One suite tick: the eight steps below run in order every
    /// `config.tick_interval_ms`.
    pub async fn run_tick(&mut self) -> SchedulerResult<TickReport> {
        self.tick_count += 1;
        let mut report = TickReport::default();

        // 1. Drain any xtrigger results that arrived since the last tick.
        self.xtriggers.drain_results();

        if self.paused {
            return Ok(report);
        }

        // 2. Evaluate wall-clock / custom xtriggers for every proxy still
        // waiting on one, firing whichever are now satisfied.
        self.evaluate_xtriggers();

        // 3 & 4. Admit queued proxies up to their queue limits, then submit.
        let ready = self.pool.ready_for_submission();
        for id in ready {
            self.submit_one(&id).await?;
            report.submitted += 1;
        }

        // 5. Poll proxies whose execution-poll timer is due.
        let now = Instant::now();
        let due: Vec<ProxyId> = self
            .pool
            .iter()
            .filter(|p| self.events.poll_due(p, now))
            .map(|p| p.id.clone())
            .collect();
        for id in due {
            self.poll_one(&id).await?;
            report.polled += 1;
        }

        // 6. Broadcast is consulted lazily at prepare_submit (via
        // `submit_one`) and does not need a standalone step here.

        // 7. Retire proxies nothing outstanding can still reference.
        report.retired = self.pool.retire_completed()?.len();

        // 8. Stall detection.
        report.stalled = self.pool.is_stalled();
        if report.stalled {
            warn!("scheduler stalled: no task can currently make progress");
        }

        // 9. Checkpoint on the configured interval.
        self.maybe_checkpoint()?;

        report.should_shut_down = self.stop_requested || self.pool.should_shut_down();
        Ok(report)
    }

    /// Step 2 of the tick: `wall_clock` is cheap and checked directly;
    /// custom xtriggers are dispatched through `XtriggerManager::poll`'s
    /// worker pool and their memoized result picked up here or on a later
    /// tick once `drain_results` has run.
    fn evaluate_xtriggers(&mut self) {
        let pending = self.pool.proxies_with_pending_xtriggers();
        for id in pending {
            let reqs = match self.pool.get(&id) {
                Some(p) => p.xtrigger_requirements.clone(),
                None => continue,
            };
            let mut newly_fired = Vec::new();
            for (idx, req) in reqs.iter().enumerate() {
                let already = self.pool.get(&id).map(|p| p.xtrigger_fired(idx)).unwrap_or(true);
                if already {
                    continue;
                }
                let fired = match req {
                    XtriggerRequirement::WallClock { offset } => match id.cycle.as_utc() {
                        Some(wallclock) => self.xtriggers.wall_clock(wallclock, offset, chrono::Utc::now()),
                        // Integer cycle points have no real-world instant;
                        // a wall_clock xtrigger on one cannot gate anything.
                        None => true,
                    },
                    XtriggerRequirement::Custom(call) => matches!(self.xtriggers.poll(call), Ok(Some(true))),
                };
                if fired {
                    newly_fired.push(idx);
                }
            }
            if let Some(proxy) = self.pool.get_mut(&id) {
                for idx in newly_fired {
                    proxy.fire_xtrigger(idx);
                }
            }
        }
    }

    async fn submit_one(&mut self, id: &ProxyId) -> SchedulerResult<()> {
        let task_name = id.name.clone();
        let cycle = id.cycle;
        let runner_name = self
            .broadcast
            .get(&task_name, &cycle, "job runner")
            .map(|s| s.to_string())
            .unwrap_or_else(|| "background".to_string());
        let runner = self.runners.get(&runner_name).ok_or_else(|| {
            crate::error::SchedulerError::RunnerSubmit(format!("no such job runner: {runner_name}"))
        })?;

        let proxy = self
            .pool
            .get_mut(id)
            .ok_or_else(|| crate::error::SchedulerError::ProxyNotFound(id.to_string()))?;
        proxy.prepare_submit()?;
        let submit_num = proxy.submit_num;
        let env = self.broadcast.resolve_all(&task_name, &cycle);

        let outcome = runner
            .submit(SubmitRequest {
                task_id: task_name.clone(),
                cycle: cycle.to_string(),
                submit_num,
                env,
            })
            .await;

        let proxy = self.pool.get_mut(id).expect("proxy present through submission");
        match outcome {
            Ok(result) => {
                proxy.on_submit_result(true, Some(result.job_id))?;
                self.checkpoint_proxy(id)?;
            }
            Err(e) => {
                warn!(task = %id, error = %e, "job submission failed");
                proxy.on_submit_result(false, None)?;
            }
        }
        Ok(())
    }

    async fn poll_one(&mut self, id: &ProxyId) -> SchedulerResult<()> {
        let job_id = match self.pool.get(id).and_then(|p| p.job_id.clone()) {
            Some(j) => j,
            None => return Ok(()),
        };
        let runner_name = self
            .broadcast
            .get(&id.name, &id.cycle, "job runner")
            .unwrap_or("background")
            .to_string();
        let runner = self
            .runners
            .get(&runner_name)
            .ok_or_else(|| crate::error::SchedulerError::RunnerPoll(format!("no such job runner: {runner_name}")))?;
        let observed = runner.poll(&job_id).await.unwrap_or(PolledJobState::NotFound);

        let now = Instant::now();
        if let Some(proxy) = self.pool.get(id) {
            self.events.record_poll_issued(proxy, now);
        }
        if let Some(proxy) = self.pool.get_mut(id) {
            self.events.handle_poll(proxy, observed)?;
            self.checkpoint_proxy_silent(id);
        }
        Ok(())
    }

    /// Apply an externally-received job message (from the message bus /
    /// simulated job) to its TaskProxy, then fan its output out to the pool
    /// so downstream prerequisites are satisfied and new proxies spawn.
    pub async fn handle_message(&mut self, proxy_id: ProxyId, submit_num: u32, severity: Severity, output: String) -> SchedulerResult<()> {
        let proxy = self
            .pool
            .get_mut(&proxy_id)
            .ok_or_else(|| crate::error::SchedulerError::ProxyNotFound(proxy_id.to_string()))?;
        let accepted = self.events.handle_message(
            proxy,
            InboundMessage {
                proxy: proxy_id.clone(),
                submit_num,
                severity,
                output: output.clone(),
            },
        )?;
        if accepted {
            self.pool.on_output(&proxy_id, &output)?;
            self.checkpoint_proxy(&proxy_id)?;
        }
        Ok(())
    }

    fn maybe_checkpoint(&mut self) -> SchedulerResult<()> {
        let due = match self.last_checkpoint {
            None => true,
            Some(t) => t.elapsed().as_millis() as u64 >= self.config.checkpoint_interval_ms,
        };
        if !due {
            return Ok(());
        }
        if let Some(store) = &self.store {
            for proxy in self.pool.iter() {
                store.save_proxy(proxy)?;
            }
            store.save_broadcast_snapshot(&self.broadcast.snapshot()?)?;
            for (label, satisfied) in self.xtriggers.all_memoized() {
                store.save_xtrigger_result(&label, satisfied)?;
            }
            store.flush()?;
        }
        self.last_checkpoint = Some(Instant::now());
        Ok(())
    }

    fn checkpoint_proxy(&self, id: &ProxyId) -> SchedulerResult<()> {
        if let (Some(store), Some(proxy)) = (&self.store, self.pool.get(id)) {
            store.save_proxy(proxy)?;
        }
        Ok(())
    }

    fn checkpoint_proxy_silent(&self, id: &ProxyId) {
        let _ = self.checkpoint_proxy(id);
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Rebuild the pool, broadcast table, and xtrigger memo from the Store
    /// after a crash (spec.md §4.8, §6). Returns the ids of every restored
    /// proxy that was `submitted`/`running` before the crash — the caller
    /// (normally the scheduler's own startup sequence) must poll each of
    /// these to reconcile against the job runner's actual state before
    /// resuming the tick loop, per spec.md §6: "On restart: replay, then
    /// poll every proxy that was submitted/running to reconcile." A no-op,
    /// returning an empty list, if no store is configured.
    pub async fn restart_and_reconcile(&mut self) -> SchedulerResult<Vec<ProxyId>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };

        let proxies = store.load_all_proxies()?;
        let mut to_poll = Vec::new();
        for proxy in proxies {
            let id = proxy.id.clone();
            if matches!(proxy.status, TaskStatus::Submitted | TaskStatus::Running) {
                to_poll.push(id);
            }
            self.pool.restore_proxy(proxy);
        }

        if let Some(snapshot) = store.load_broadcast_snapshot()? {
            self.broadcast.restore(&snapshot)?;
        }
        for (label, satisfied) in store.load_xtrigger_results()? {
            self.xtriggers.restore_result(label, satisfied);
        }

        info!(restored = to_poll.len(), "restarting: polling proxies that were in flight");
        for id in &to_poll {
            self.poll_one(id).await?;
        }
        Ok(to_poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_def::TaskDefinition;

    fn context() -> SchedulerContext {
        let icp = CyclePoint::integer(1);
        let seq = crate::sequence::Sequence::parse("R/P1", &icp).unwrap();
        let mut defs = TaskDefinitionSet::new();
        defs.insert(TaskDefinition::new("foo", vec![seq], ""));
        SchedulerContext {
            config: SchedulerConfig {
                runahead_limit: "3".to_string(),
                ..SchedulerConfig::default()
            },
            defs,
            icp,
            runners: JobRunnerRegistry::default(),
        }
    }

    #[tokio::test]
    async fn tick_submits_and_runs_a_single_task_to_completion() {
        let mut sched = Scheduler::new(context()).unwrap();
        sched.pool_mut().spawn("foo", CyclePoint::integer(1), 1).unwrap();

        let report = sched.run_tick().await.unwrap();
        assert_eq!(report.submitted, 1);

        let id = ProxyId {
            name: "foo".into(),
            cycle: CyclePoint::integer(1),
            flow_tag: 1,
        };
        let submit_num = sched.pool().get(&id).unwrap().submit_num;
        sched
            .handle_message(id.clone(), submit_num, Severity::Info, "started".to_string())
            .await
            .unwrap();
        sched
            .handle_message(id.clone(), submit_num, Severity::Info, "succeeded".to_string())
            .await
            .unwrap();

        assert_eq!(sched.pool().get(&id).unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn paused_scheduler_does_not_submit() {
        let mut sched = Scheduler::new(context()).unwrap();
        sched.pool_mut().spawn("foo", CyclePoint::integer(1), 1).unwrap();
        sched.pause();
        let report = sched.run_tick().await.unwrap();
        assert_eq!(report.submitted, 0);
    }

    fn context_with_store(store_path: std::path::PathBuf) -> SchedulerContext {
        let mut ctx = context();
        ctx.config.store_path = Some(store_path);
        ctx
    }

    #[tokio::test]
    async fn restart_and_reconcile_restores_pool_and_polls_in_flight_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let mut sched = Scheduler::new(context_with_store(dir.path().to_path_buf())).unwrap();
            sched.pool_mut().spawn("foo", CyclePoint::integer(1), 1).unwrap();
            sched.broadcast_mut().put(
                crate::broadcast::CycleScope::All,
                crate::broadcast::Namespace::Root,
                "job runner",
                "background",
            );
            let report = sched.run_tick().await.unwrap();
            assert_eq!(report.submitted, 1);
            id = sched.pool().iter().next().unwrap().id.clone();
            assert_eq!(sched.pool().get(&id).unwrap().status, TaskStatus::Submitted);
            // scheduler (and its Store handle) drops here, simulating a crash
            // right after submission; `submit_one` already checkpointed the
            // proxy to disk before this block ends.
        }

        let mut restarted = Scheduler::new(context_with_store(dir.path().to_path_buf())).unwrap();
        let polled = restarted.restart_and_reconcile().await.unwrap();
        assert_eq!(polled, vec![id.clone()]);

        let restored = restarted.pool().get(&id).unwrap();
        assert_eq!(restored.status, TaskStatus::Submitted);
        assert!(restored.job_id.is_some());
    }
}
