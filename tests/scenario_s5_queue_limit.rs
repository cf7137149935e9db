//! S5 — queue limit: 10 mutually-independent tasks share queue `q` with
//! `limit = 3`. At every tick until the suite finishes, no more than 3
//! proxies may be in `{preparing, submitted, running}` at once.

use std::collections::HashMap;

use cylc_scheduler::config::SchedulerConfig;
use cylc_scheduler::cycle::CyclePoint;
use cylc_scheduler::events::Severity;
use cylc_scheduler::job_runner::JobRunnerRegistry;
use cylc_scheduler::scheduler::{Scheduler, SchedulerContext};
use cylc_scheduler::sequence::Sequence;
use cylc_scheduler::task_def::{TaskDefinition, TaskDefinitionSet};
use cylc_scheduler::task_proxy::{ProxyId, TaskStatus};

#[tokio::test]
async fn queue_limit_never_exceeded_across_the_whole_run() {
    let dir = tempfile::tempdir().unwrap();
    let icp = CyclePoint::integer(1);
    let seq = Sequence::parse("R1/1/P1", &icp).unwrap();

    let mut defs = TaskDefinitionSet::new();
    let names: Vec<String> = (1..=10).map(|n| format!("t{n}")).collect();
    for name in &names {
        defs.insert(TaskDefinition::new(name.clone(), vec![seq.clone()], ""));
    }

    let mut sched = Scheduler::new(SchedulerContext {
        config: SchedulerConfig {
            runahead_limit: "P1".to_string(),
            queues: HashMap::from([(
                "q".to_string(),
                cylc_scheduler::config::QueueSetting {
                    members: names.clone(),
                    limit: 3,
                },
            )]),
            store_path: Some(dir.path().to_path_buf()),
            ..SchedulerConfig::default()
        },
        defs,
        icp,
        runners: JobRunnerRegistry::default(),
    })
    .unwrap();
    sched.pool_mut().seed_initial(1).unwrap();

    for _ in 0..30 {
        let report = sched.run_tick().await.unwrap();

        let in_flight = sched
            .pool()
            .iter()
            .filter(|p| matches!(p.status, TaskStatus::Preparing | TaskStatus::Submitted | TaskStatus::Running))
            .count();
        assert!(in_flight <= 3, "queue limit exceeded: {in_flight} in flight");

        let submitted: Vec<ProxyId> = sched
            .pool()
            .iter()
            .filter(|p| p.status == TaskStatus::Submitted)
            .map(|p| p.id.clone())
            .collect();
        for id in submitted {
            let submit_num = sched.pool().get(&id).unwrap().submit_num;
            sched
                .handle_message(id.clone(), submit_num, Severity::Info, "started".to_string())
                .await
                .unwrap();
            sched
                .handle_message(id, submit_num, Severity::Info, "succeeded".to_string())
                .await
                .unwrap();
        }

        if report.should_shut_down {
            break;
        }
    }

    for name in &names {
        let id = ProxyId {
            name: name.clone(),
            cycle: CyclePoint::integer(1),
            flow_tag: 1,
        };
        assert_eq!(sched.pool().get(&id).unwrap().status, TaskStatus::Succeeded);
    }
}
