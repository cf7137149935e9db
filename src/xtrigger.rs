//! XtriggerManager: external trigger conditions a TaskProxy can depend on
//! alongside ordinary task-output prerequisites.
//!
//! `wall_clock` is evaluated synchronously in the scheduler tick (grounded in
//! `original_source/cylc/flow/xtriggers/wall_clock.py`, confirmed
//! synchronous and sequential-by-default). Custom xtriggers are dispatched
//! to a worker pool and memoized, grounded in
//! `knhk-workflow-engine/src/executor.rs::start_timer_loop` (a `tokio::spawn`
//! loop draining an `mpsc::Receiver` and feeding results back into shared
//! state).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cycle::Interval;
use crate::error::SchedulerError;

/// A custom xtrigger function. Errors are treated as "not yet satisfied"
/// rather than propagated — an xtrigger that cannot evaluate this tick
/// should not crash the scheduler.
#[async_trait]
pub trait Xtrigger: Send + Sync {
    fn name(&self) -> &str;
    async fn evaluate(&self, args: &HashMap<String, String>) -> Result<(bool, Value), String>;
}

/// One xtrigger a `TaskDefinition` gates submission on, resolved per-proxy
/// at creation. `WallClock` is evaluated synchronously every tick (spec.md
/// §4.5); `Custom` goes through `XtriggerManager::poll`'s worker pool and is
/// memoized by its call label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum XtriggerRequirement {
    WallClock { offset: Interval },
    Custom(XtriggerCall),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XtriggerCall {
    pub function: String,
    pub args: HashMap<String, String>,
    pub sequential: bool,
}

impl XtriggerCall {
    /// Memoization / log label, e.g. `wall_clock(offset=PT1H)`.
    pub fn label(&self) -> String {
        let mut pairs: Vec<(&String, &String)> = self.args.iter().collect();
        pairs.sort_by_key(|(k, _)| k.as_str());
        let args = pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.function, args)
    }
}

struct Memo {
    satisfied: bool,
    result: Value,
}

enum AsyncFired {
    Done { label: String, satisfied: bool, result: Value },
    Errored { label: String, message: String },
}

pub struct XtriggerManager {
    memo: HashMap<String, Memo>,
    pending: HashSet<String>,
    functions: HashMap<String, Arc<dyn Xtrigger>>,
    sequential_in_flight: bool,
    tx: mpsc::Sender<AsyncFired>,
    rx: mpsc::Receiver<AsyncFired>,
}

impl XtriggerManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(256);
        XtriggerManager {
            memo: HashMap::new(),
            pending: HashSet::new(),
            functions: HashMap::new(),
            sequential_in_flight: false,
            tx,
            rx,
        }
    }

    pub fn register(&mut self, func: Arc<dyn Xtrigger>) {
        self.functions.insert(func.name().to_string(), func);
    }

    /// `wall_clock(offset)`: true once real time has passed `cycle + offset`.
    /// Evaluated synchronously, never dispatched to the worker pool.
    pub fn wall_clock(&self, cycle_wallclock: DateTime<Utc>, offset: &Interval, now: DateTime<Utc>) -> bool {
        let offset_secs = match offset {
            Interval::Calendar(d) => d.days * 86_400 + d.hours * 3600 + d.minutes * 60 + d.seconds,
            Interval::Integer(_) => 0,
        };
        let trigger_time = cycle_wallclock + chrono::Duration::seconds(offset_secs);
        now > trigger_time
    }

    /// Drain any async results that arrived since the last tick, without
    /// blocking. Call once per scheduler tick before `poll`.
    pub fn drain_results(&mut self) {
        while let Ok(fired) = self.rx.try_recv() {
            match fired {
                AsyncFired::Done { label, satisfied, result } => {
                    debug!(xtrigger = %label, satisfied, "xtrigger evaluation complete");
                    self.memo.insert(label.clone(), Memo { satisfied, result });
                    self.pending.remove(&label);
                }
                AsyncFired::Errored { label, message } => {
                    warn!(xtrigger = %label, error = %message, "xtrigger evaluation failed; treating as unsatisfied");
                    self.pending.remove(&label);
                }
            }
            self.sequential_in_flight = false;
        }
    }

    /// Current memoized status for `call`: `Some(true/false)` once a result
    /// is known, `None` while still pending. Once `Some(true)` is recorded
    /// it is never re-evaluated — cylc xtriggers are satisfied permanently.
    pub fn poll(&mut self, call: &XtriggerCall) -> Result<Option<bool>, SchedulerError> {
        let label = call.label();
        if let Some(memo) = self.memo.get(&label) {
            return Ok(Some(memo.satisfied));
        }
        if self.pending.contains(&label) {
            return Ok(None);
        }
        if call.sequential && self.sequential_in_flight {
            return Ok(None);
        }
        let func = self
            .functions
            .get(&call.function)
            .cloned()
            .ok_or_else(|| SchedulerError::Xtrigger(call.function.clone(), "no such xtrigger function registered".into()))?;

        self.pending.insert(label.clone());
        if call.sequential {
            self.sequential_in_flight = true;
        }
        let args = call.args.clone();
        let tx = self.tx.clone();
        let label_for_task = label.clone();
        tokio::spawn(async move {
            let fired = match func.evaluate(&args).await {
                Ok((satisfied, result)) => AsyncFired::Done {
                    label: label_for_task,
                    satisfied,
                    result,
                },
                Err(message) => AsyncFired::Errored {
                    label: label_for_task,
                    message,
                },
            };
            let _ = tx.send(fired).await;
        });
        Ok(None)
    }

    pub fn result(&self, call: &XtriggerCall) -> Option<&Value> {
        self.memo.get(&call.label()).map(|m| &m.result)
    }

    /// Every memoized call result, for `Store::save_xtrigger_result` (spec.md
    /// §6: "memoised xtrigger results" are part of persisted state).
    pub fn all_memoized(&self) -> Vec<(String, bool)> {
        self.memo.iter().map(|(label, m)| (label.clone(), m.satisfied)).collect()
    }

    /// Restore a memoized result loaded from the `Store`. The original
    /// result payload (`dict[str,str]`) is not itself persisted — only the
    /// satisfied flag — so a restored entry carries `Value::Null`; this
    /// still fulfils spec.md §4.5's "stays satisfied for the remainder of
    /// the run", which only depends on the boolean.
    pub fn restore_result(&mut self, label: impl Into<String>, satisfied: bool) {
        self.memo.insert(
            label.into(),
            Memo {
                satisfied,
                result: Value::Null,
            },
        );
    }
}

impl Default for XtriggerManager {
    fn default() -> Self {
        Self::new()
    }
}
