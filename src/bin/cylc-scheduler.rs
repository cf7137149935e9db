//! `cylc-scheduler` — thin CLI wiring around the core scheduling engine.
//!
//! Graph parsing, Jinja2/EmPy preprocessing, and the wire transport that a
//! real deployment would front this with are all out of scope per spec.md
//! §1; this binary reads a suite's `TaskDefinition`s from a JSON file (the
//! shape the graph-language parser would otherwise produce) and drives the
//! scheduler's main loop until shutdown.
//!
//! Grounded in `knhk-workflow-engine/src/bin/knhk-workflow.rs`'s
//! `clap::Parser` + `tokio::main` shape.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use cylc_scheduler::config::{Cli, SchedulerConfig};
use cylc_scheduler::cycle::CyclePoint;
use cylc_scheduler::job_runner::{BackgroundRunner, JobRunnerRegistry, SimulationRunner};
use cylc_scheduler::scheduler::{Scheduler, SchedulerContext};
use cylc_scheduler::task_def::TaskDefinitionSet;
use cylc_scheduler::task_proxy::PolledJobState;
use cylc_scheduler::{SchedulerError, SchedulerResult};

/// Parse an initial cycle point given on the command line: `i<N>` for an
/// integer sequence, otherwise a bare `YYYY-MM-DDTHH:MM:SS` Gregorian
/// instant. Full ISO-8601 recurrence parsing lives in `cycle::Sequence`;
/// this is just enough to seed `--icp`.
fn parse_icp(raw: &str) -> SchedulerResult<CyclePoint> {
    if let Some(n) = raw.strip_prefix('i') {
        let n: i64 = n
            .parse()
            .map_err(|_| SchedulerError::Input(format!("bad integer ICP: {raw}")))?;
        return Ok(CyclePoint::integer(n));
    }
    let parts: Vec<&str> = raw.splitn(2, 'T').collect();
    let date: Vec<&str> = parts[0].splitn(3, '-').collect();
    if date.len() != 3 {
        return Err(SchedulerError::Input(format!("bad ICP: {raw}")));
    }
    let (year, month, day) = (
        date[0].parse().map_err(|_| SchedulerError::Input(format!("bad ICP: {raw}")))?,
        date[1].parse().map_err(|_| SchedulerError::Input(format!("bad ICP: {raw}")))?,
        date[2].parse().map_err(|_| SchedulerError::Input(format!("bad ICP: {raw}")))?,
    );
    let (hour, minute, second) = match parts.get(1) {
        Some(t) => {
            let hms: Vec<&str> = t.splitn(3, ':').collect();
            (
                hms.first().and_then(|s| s.parse().ok()).unwrap_or(0),
                hms.get(1).and_then(|s| s.parse().ok()).unwrap_or(0),
                hms.get(2).and_then(|s| s.parse().ok()).unwrap_or(0),
            )
        }
        None => (0, 0, 0),
    };
    Ok(CyclePoint::gregorian(year, month, day, hour, minute, second))
}

/// Load the suite's `TaskDefinition`s from a JSON file: `{"tasks": [...]}`,
/// each a `TaskDefinition` with `sequences` already expressed against the
/// given ICP (the graph-language parser that would produce this is out of
/// scope per spec.md §1).
fn load_suite(path: &std::path::Path, icp: &CyclePoint) -> SchedulerResult<TaskDefinitionSet> {
    let raw = fs::read_to_string(path).map_err(|e| SchedulerError::Input(format!("reading {}: {e}", path.display())))?;
    #[derive(serde::Deserialize)]
    struct SuiteFile {
        tasks: Vec<SuiteTask>,
    }
    #[derive(serde::Deserialize)]
    struct SuiteTask {
        name: String,
        sequences: Vec<String>,
        #[serde(default)]
        dependencies: String,
        #[serde(flatten)]
        rest: serde_json::Value,
    }
    let parsed: SuiteFile = serde_json::from_str(&raw).map_err(|e| SchedulerError::Input(format!("parsing {}: {e}", path.display())))?;

    let mut defs = TaskDefinitionSet::new();
    for t in parsed.tasks {
        let sequences = t
            .sequences
            .iter()
            .map(|s| cylc_scheduler::sequence::Sequence::parse(s, icp))
            .collect::<SchedulerResult<Vec<_>>>()?;
        let mut def = cylc_scheduler::task_def::TaskDefinition::new(t.name, sequences, t.dependencies);
        if let Some(job_runner) = t.rest.get("job_runner").and_then(|v| v.as_str()) {
            def.job_runner = job_runner.to_string();
        }
        if let Some(outs) = t.rest.get("custom_outputs").and_then(|v| v.as_array()) {
            def.custom_outputs = outs.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        }
        if let Some(offsets) = t.rest.get("wall_clock_xtriggers").and_then(|v| v.as_array()) {
            for raw in offsets.iter().filter_map(|v| v.as_str()) {
                let offset = cylc_scheduler::cycle::Interval::parse(raw)?;
                def.xtriggers.push(cylc_scheduler::xtrigger::XtriggerRequirement::WallClock { offset });
            }
        }
        defs.insert(def);
    }
    Ok(defs)
}

#[tokio::main]
async fn main() -> SchedulerResult<()> {
    cylc_scheduler::logging::init();

    let cli = Cli::parse();
    let icp = parse_icp(&cli.icp)?;
    let config = SchedulerConfig::load(&cli)?;
    let tick_interval_ms = config.tick_interval_ms;
    let defs = load_suite(&cli.suite_file, &icp)?;

    let mut runners = JobRunnerRegistry::new();
    runners.register(Arc::new(BackgroundRunner::new()));
    runners.register(Arc::new(SimulationRunner::new(PolledJobState::Running)));

    let mut scheduler = Scheduler::new(SchedulerContext {
        config,
        defs,
        icp,
        runners,
    })?;

    // Rebuild the pool from the Store before seeding anything new: a
    // restarted suite resumes in-flight proxies rather than re-spawning
    // them from scratch.
    let restored = scheduler.restart_and_reconcile().await?;
    if !restored.is_empty() {
        info!(count = restored.len(), "resumed in-flight tasks from store");
    }

    // Seed initial proxies: every task whose dependency expression is empty
    // starts the graph, flow 1, at the first point of each of its
    // sequences on or after the ICP. `spawn` is idempotent, so restored
    // proxies are left untouched here.
    let seeded = scheduler.pool_mut().seed_initial(1)?;
    info!(count = seeded.len(), icp = %icp, "starting scheduler");
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(tick_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, requesting clean stop");
                scheduler.request_stop();
            }
        }
        let report = scheduler.run_tick().await?;
        if report.should_shut_down {
            info!("shutdown condition reached, exiting");
            break;
        }
        if report.stalled {
            error!("suite has stalled");
        }
    }
    Ok(())
}
