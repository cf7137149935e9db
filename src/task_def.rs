//! TaskDefinition: the immutable, suite-config-level description of a task
//! — name, recurrence, dependency expression text, declared outputs, retry
//! policy, and job submission parameters. One `TaskDefinition` is shared by
//! every `TaskProxy` instance of that task across all cycle points and flows.
//!
//! Grounded in `knhk-workflow-engine/src/parser.rs`'s `WorkflowSpec` (the
//! static, parsed definition a `Case` instantiates against).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cycle::Interval;
use crate::prerequisite::OutputValidator;
use crate::sequence::Sequence;
use crate::xtrigger::XtriggerRequirement;

/// The standard outputs every task has, regardless of suite config.
pub const IMPLICIT_OUTPUTS: [&str; 4] = ["submitted", "started", "succeeded", "failed"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub sequences: Vec<Sequence>,
    /// Raw dependency expression text, one per sequence it applies under.
    pub dependencies: String,
    /// Outputs this task declares beyond the implicit four, e.g. custom
    /// messages registered with `cylc message`.
    pub custom_outputs: Vec<String>,
    /// Execution-retry delays (`retrying` status). Spec.md §4.8: "`retrying`
    /// uses the execution-retry list."
    pub retry_delays: Vec<Interval>,
    /// Submission-retry delays (`submit-retrying` status), a separate list
    /// per spec.md §4.8: "`submit-retrying` uses its own list."
    pub submit_retry_delays: Vec<Interval>,
    pub execution_time_limit: Option<Interval>,
    pub job_runner: String,
    pub submission_poll_delays: Vec<Interval>,
    pub execution_poll_delays: Vec<Interval>,
    pub xtriggers: Vec<XtriggerRequirement>,
    pub expire_after: Option<Interval>,
    pub held_on_submit: bool,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, sequences: Vec<Sequence>, dependencies: impl Into<String>) -> Self {
        TaskDefinition {
            name: name.into(),
            sequences,
            dependencies: dependencies.into(),
            custom_outputs: Vec::new(),
            retry_delays: Vec::new(),
            submit_retry_delays: Vec::new(),
            execution_time_limit: None,
            job_runner: "background".to_string(),
            submission_poll_delays: Vec::new(),
            execution_poll_delays: Vec::new(),
            xtriggers: Vec::new(),
            expire_after: None,
            held_on_submit: false,
        }
    }

    pub fn declares_output(&self, output: &str) -> bool {
        IMPLICIT_OUTPUTS.contains(&output) || self.custom_outputs.iter().any(|o| o == output)
    }

    pub fn max_try_num(&self) -> u32 {
        self.retry_delays.len() as u32 + 1
    }
}

/// Registry of every `TaskDefinition` in a suite. Shared (read-mostly) state
/// that `Prerequisite::parse` validates atoms against.
#[derive(Debug, Default)]
pub struct TaskDefinitionSet {
    defs: HashMap<String, TaskDefinition>,
}

impl TaskDefinitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, def: TaskDefinition) {
        self.defs.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.defs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(|s| s.as_str())
    }
}

impl OutputValidator for TaskDefinitionSet {
    fn task_exists(&self, task_name: &str) -> bool {
        self.defs.contains_key(task_name)
    }

    fn output_exists(&self, task_name: &str, output: &str) -> bool {
        self.defs
            .get(task_name)
            .map(|d| d.declares_output(output))
            .unwrap_or(false)
    }
}
