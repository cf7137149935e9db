//! JobRunner: the pluggable batch-system interface a TaskProxy's job is
//! submitted, polled, and killed through.
//!
//! Grounded in `knhk-workflow-engine/src/executor.rs`'s `Arc<dyn Trait>`
//! service-handle pattern (`timer_service: Arc<TimerService<SysClock>>`) —
//! here `Arc<dyn JobRunner>` plays the same role. Concrete batch-system
//! handlers (`pbs`, `sge`, `slurm`, `loadleveler`) stay out of scope per
//! spec.md §1; only the trait plus a `background` and a `simulation`
//! reference collaborator are implemented, matching
//! `original_source/lib/cylc/job_submission/background.py`'s shape without
//! its directive-formatting internals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::SchedulerResult;
use crate::task_proxy::PolledJobState;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_id: String,
    pub cycle: String,
    pub submit_num: u32,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: String,
}

/// The batch-system capability every job-runner handler provides.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn name(&self) -> &str;
    async fn submit(&self, request: SubmitRequest) -> SchedulerResult<SubmitOutcome>;
    async fn poll(&self, job_id: &str) -> SchedulerResult<PolledJobState>;
    async fn kill(&self, job_id: &str) -> SchedulerResult<()>;
}

/// A poll landing `NotFound` right after submission is ambiguous: the job
/// may simply not have registered with the batch system queue yet. Cylc
/// gives it a grace window before treating `NotFound` as job loss.
pub struct PollGraceWindow {
    submitted_at: HashMap<String, Instant>,
    grace: Duration,
}

impl PollGraceWindow {
    pub fn new(grace: Duration) -> Self {
        PollGraceWindow {
            submitted_at: HashMap::new(),
            grace,
        }
    }

    pub fn record_submission(&mut self, job_id: &str) {
        self.submitted_at.insert(job_id.to_string(), Instant::now());
    }

    /// Reinterpret a raw poll result: `NotFound` inside the grace window is
    /// downgraded to "no information yet" (`None`); outside it, job loss.
    pub fn reconcile(&mut self, job_id: &str, observed: PolledJobState) -> Option<PolledJobState> {
        if observed != PolledJobState::NotFound {
            self.submitted_at.remove(job_id);
            return Some(observed);
        }
        match self.submitted_at.get(job_id) {
            Some(t) if t.elapsed() < self.grace => None,
            _ => {
                self.submitted_at.remove(job_id);
                Some(PolledJobState::NotFound)
            }
        }
    }
}

/// Runs jobs as plain background processes — the simplest real batch
/// system, and cylc's own fallback when no runner is configured.
pub struct BackgroundRunner {
    jobs: Mutex<HashMap<String, PolledJobState>>,
}

impl BackgroundRunner {
    pub fn new() -> Self {
        BackgroundRunner {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for BackgroundRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRunner for BackgroundRunner {
    fn name(&self) -> &str {
        "background"
    }

    async fn submit(&self, request: SubmitRequest) -> SchedulerResult<SubmitOutcome> {
        let job_id = format!("bg-{}", Uuid::new_v4());
        info!(task = %request.task_id, job_id = %job_id, "submitted background job");
        self.jobs.lock().insert(job_id.clone(), PolledJobState::Running);
        Ok(SubmitOutcome { job_id })
    }

    async fn poll(&self, job_id: &str) -> SchedulerResult<PolledJobState> {
        Ok(self.jobs.lock().get(job_id).copied().unwrap_or(PolledJobState::NotFound))
    }

    async fn kill(&self, job_id: &str) -> SchedulerResult<()> {
        self.jobs.lock().remove(job_id);
        Ok(())
    }
}

/// A deterministic, in-memory runner for tests: every job immediately
/// transitions through a caller-supplied outcome on its first poll.
pub struct SimulationRunner {
    outcomes: Mutex<HashMap<String, PolledJobState>>,
    default_outcome: PolledJobState,
}

impl SimulationRunner {
    pub fn new(default_outcome: PolledJobState) -> Self {
        SimulationRunner {
            outcomes: Mutex::new(HashMap::new()),
            default_outcome,
        }
    }

    pub fn set_outcome(&self, job_id: &str, outcome: PolledJobState) {
        self.outcomes.lock().insert(job_id.to_string(), outcome);
    }
}

#[async_trait]
impl JobRunner for SimulationRunner {
    fn name(&self) -> &str {
        "simulation"
    }

    async fn submit(&self, request: SubmitRequest) -> SchedulerResult<SubmitOutcome> {
        let job_id = format!("sim-{}-{}", request.task_id, request.submit_num);
        Ok(SubmitOutcome { job_id })
    }

    async fn poll(&self, job_id: &str) -> SchedulerResult<PolledJobState> {
        Ok(self.outcomes.lock().get(job_id).copied().unwrap_or(self.default_outcome))
    }

    async fn kill(&self, _job_id: &str) -> SchedulerResult<()> {
        Ok(())
    }
}

/// Registry of named runners, resolved per task by its `job_runner` field
/// (itself overridable via `Broadcast`).
#[derive(Clone)]
pub struct JobRunnerRegistry {
    runners: HashMap<String, Arc<dyn JobRunner>>,
}

impl JobRunnerRegistry {
    pub fn new() -> Self {
        JobRunnerRegistry {
            runners: HashMap::new(),
        }
    }

    pub fn register(&mut self, runner: Arc<dyn JobRunner>) {
        self.runners.insert(runner.name().to_string(), runner);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(name).cloned()
    }
}

impl Default for JobRunnerRegistry {
    fn default() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(BackgroundRunner::new()));
        reg
    }
}
