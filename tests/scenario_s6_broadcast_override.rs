//! S6 — broadcast override: a setting broadcast to `a@2` is not visible to
//! `a@1`, which already prepared its submission before the broadcast was
//! made; a later proxy at the broadcast cycle sees it. Visibility is
//! observed through a recording `JobRunner` that captures the resolved
//! environment each submission actually saw.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use cylc_scheduler::broadcast::{CycleScope, Namespace};
use cylc_scheduler::config::SchedulerConfig;
use cylc_scheduler::cycle::CyclePoint;
use cylc_scheduler::error::SchedulerResult;
use cylc_scheduler::job_runner::{JobRunner, JobRunnerRegistry, SubmitOutcome, SubmitRequest};
use cylc_scheduler::scheduler::{Scheduler, SchedulerContext};
use cylc_scheduler::sequence::Sequence;
use cylc_scheduler::task_def::{TaskDefinition, TaskDefinitionSet};
use cylc_scheduler::task_proxy::PolledJobState;

/// Records every submission's resolved environment instead of actually
/// running anything, so a test can inspect what a job would have seen.
struct RecordingRunner {
    seen: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl RecordingRunner {
    fn new() -> Self {
        RecordingRunner { seen: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl JobRunner for RecordingRunner {
    fn name(&self) -> &str {
        "background"
    }

    async fn submit(&self, request: SubmitRequest) -> SchedulerResult<SubmitOutcome> {
        self.seen.lock().unwrap().push((request.cycle.clone(), request.env));
        Ok(SubmitOutcome {
            job_id: format!("rec-{}-{}", request.task_id, request.submit_num),
        })
    }

    async fn poll(&self, _job_id: &str) -> SchedulerResult<PolledJobState> {
        Ok(PolledJobState::Running)
    }

    async fn kill(&self, _job_id: &str) -> SchedulerResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn broadcast_set_after_a_proxy_submits_does_not_retroactively_apply() {
    let dir = tempfile::tempdir().unwrap();
    let icp = CyclePoint::integer(1);
    let seq = Sequence::parse("R/P1", &icp).unwrap();
    let mut defs = TaskDefinitionSet::new();
    defs.insert(TaskDefinition::new("a", vec![seq], ""));

    let mut runners = JobRunnerRegistry::new();
    let recorder = std::sync::Arc::new(RecordingRunner::new());
    runners.register(recorder.clone());

    let mut sched = Scheduler::new(SchedulerContext {
        config: SchedulerConfig {
            runahead_limit: "P5".to_string(),
            store_path: Some(dir.path().to_path_buf()),
            ..SchedulerConfig::default()
        },
        defs,
        icp,
        runners,
    })
    .unwrap();

    // a@1 is admitted and submitted before any broadcast exists.
    sched.pool_mut().spawn("a", CyclePoint::integer(1), 1).unwrap();
    sched.run_tick().await.unwrap();

    sched.cmd_broadcast_put(
        CycleScope::Point(CyclePoint::integer(2)),
        Namespace::Named("a".to_string()),
        "env.FOO",
        "bar",
    );

    // a@2 is spawned and submitted after the broadcast.
    sched.pool_mut().spawn("a", CyclePoint::integer(2), 1).unwrap();
    sched.run_tick().await.unwrap();

    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let (cycle_one, env_one) = &seen[0];
    assert_eq!(cycle_one, "1");
    assert!(!env_one.contains_key("env.FOO"), "a@1 must not see a broadcast made after it submitted");

    let (cycle_two, env_two) = &seen[1];
    assert_eq!(cycle_two, "2");
    assert_eq!(env_two.get("env.FOO").map(String::as_str), Some("bar"));
}
