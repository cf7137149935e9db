//! Broadcast: cycle/namespace-scoped runtime setting overrides.
//!
//! Grounded in `knhk-workflow-engine/src/state.rs`'s key-prefix layering
//! idiom (`"spec:{id}"`, `"case:{id}"`) — here the key is a
//! `(cycle scope, namespace, setting path)` triple instead of a string
//! prefix, but the same "broad key, query narrows" shape.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cycle::CyclePoint;
use crate::error::SchedulerResult;

/// Which cycle points a broadcast setting applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleScope {
    All,
    Point(CyclePoint),
}

impl CycleScope {
    /// More specific (an exact point) than `All`.
    fn specificity(&self) -> u8 {
        match self {
            CycleScope::All => 0,
            CycleScope::Point(_) => 1,
        }
    }

    fn matches(&self, cycle: &CyclePoint) -> bool {
        match self {
            CycleScope::All => true,
            CycleScope::Point(p) => p.compare(cycle).map(|o| o == Ordering::Equal).unwrap_or(false),
        }
    }
}

/// Which namespace (task or family name) a setting applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Namespace {
    Root,
    Named(String),
}

impl Namespace {
    fn specificity(&self) -> u8 {
        match self {
            Namespace::Root => 0,
            Namespace::Named(_) => 1,
        }
    }

    fn matches(&self, task_name: &str) -> bool {
        match self {
            Namespace::Root => true,
            Namespace::Named(n) => n == task_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    cycle: CycleScope,
    namespace: Namespace,
    setting: String,
    value: String,
    sequence_num: u64,
}

/// A layered table of runtime overrides. Lookups resolve by specificity:
/// an exact cycle point beats `CycleScope::All`; a named namespace beats
/// `Namespace::Root`; a later `put` beats an earlier one at equal
/// specificity. Consulted once per proxy, at `prepare_submit`.
#[derive(Debug, Default)]
pub struct Broadcast {
    entries: Vec<Entry>,
    next_sequence: u64,
}

impl Broadcast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cycle: CycleScope, namespace: Namespace, setting: impl Into<String>, value: impl Into<String>) {
        let setting = setting.into();
        let value = value.into();
        info!(?cycle, ?namespace, setting = %setting, value = %value, "broadcast set");
        self.entries.push(Entry {
            cycle,
            namespace,
            setting,
            value,
            sequence_num: self.next_sequence,
        });
        self.next_sequence += 1;
    }

    /// Remove every entry matching the given scope/namespace/setting. Any
    /// field left `None` acts as a wildcard over that field.
    pub fn clear(&mut self, cycle: Option<&CycleScope>, namespace: Option<&Namespace>, setting: Option<&str>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            let cycle_match = cycle.map(|c| c == &e.cycle).unwrap_or(true);
            let ns_match = namespace.map(|n| n == &e.namespace).unwrap_or(true);
            let setting_match = setting.map(|s| s == e.setting).unwrap_or(true);
            !(cycle_match && ns_match && setting_match)
        });
        before - self.entries.len()
    }

    /// Resolve the effective value of `setting` for `(task_name, cycle)`,
    /// if any broadcast entry applies.
    pub fn get(&self, task_name: &str, cycle: &CyclePoint, setting: &str) -> Option<&str> {
        self.entries
            .iter()
            .filter(|e| e.setting == setting && e.cycle.matches(cycle) && e.namespace.matches(task_name))
            .max_by_key(|e| (e.cycle.specificity(), e.namespace.specificity(), e.sequence_num))
            .map(|e| e.value.as_str())
    }

    /// All settings broadcast that apply to `(task_name, cycle)`, resolved
    /// to their effective values — used once at `prepare_submit` so a task's
    /// runtime config is fixed for the lifetime of that submission.
    pub fn resolve_all(&self, task_name: &str, cycle: &CyclePoint) -> HashMap<String, String> {
        let mut best: HashMap<&str, &Entry> = HashMap::new();
        for e in &self.entries {
            if !e.cycle.matches(cycle) || !e.namespace.matches(task_name) {
                continue;
            }
            let replace = match best.get(e.setting.as_str()) {
                None => true,
                Some(existing) => {
                    (e.cycle.specificity(), e.namespace.specificity(), e.sequence_num)
                        > (existing.cycle.specificity(), existing.namespace.specificity(), existing.sequence_num)
                }
            };
            if replace {
                best.insert(&e.setting, e);
            }
        }
        best.into_iter().map(|(k, v)| (k.to_string(), v.value.clone())).collect()
    }

    /// Serialize every entry for `Store::save_broadcast_snapshot` (spec.md
    /// §6: persisted state includes "Broadcast settings").
    pub fn snapshot(&self) -> SchedulerResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    /// Replace this table's entries with a previously-saved snapshot, on
    /// restart. `next_sequence` is recomputed so later `put`s still win
    /// ties against the restored entries.
    pub fn restore(&mut self, bytes: &[u8]) -> SchedulerResult<()> {
        self.entries = serde_json::from_slice(bytes)?;
        self.next_sequence = self.entries.iter().map(|e| e.sequence_num + 1).max().unwrap_or(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_cycle_beats_wildcard() {
        let mut b = Broadcast::new();
        b.put(CycleScope::All, Namespace::Root, "execution retry delays", "PT1M");
        b.put(
            CycleScope::Point(CyclePoint::integer(3)),
            Namespace::Root,
            "execution retry delays",
            "PT5M",
        );
        assert_eq!(
            b.get("foo", &CyclePoint::integer(3), "execution retry delays"),
            Some("PT5M")
        );
        assert_eq!(
            b.get("foo", &CyclePoint::integer(4), "execution retry delays"),
            Some("PT1M")
        );
    }

    #[test]
    fn named_namespace_beats_root() {
        let mut b = Broadcast::new();
        b.put(CycleScope::All, Namespace::Root, "job runner", "background");
        b.put(CycleScope::All, Namespace::Named("foo".into()), "job runner", "slurm");
        assert_eq!(b.get("foo", &CyclePoint::integer(1), "job runner"), Some("slurm"));
        assert_eq!(b.get("bar", &CyclePoint::integer(1), "job runner"), Some("background"));
    }

    #[test]
    fn later_put_wins_at_equal_specificity() {
        let mut b = Broadcast::new();
        b.put(CycleScope::All, Namespace::Root, "job runner", "background");
        b.put(CycleScope::All, Namespace::Root, "job runner", "at");
        assert_eq!(b.get("foo", &CyclePoint::integer(1), "job runner"), Some("at"));
    }

    #[test]
    fn clear_removes_matching_entries() {
        let mut b = Broadcast::new();
        b.put(CycleScope::All, Namespace::Root, "job runner", "background");
        let removed = b.clear(None, None, Some("job runner"));
        assert_eq!(removed, 1);
        assert_eq!(b.get("foo", &CyclePoint::integer(1), "job runner"), None);
    }

    #[test]
    fn resolve_all_merges_distinct_settings() {
        let mut b = Broadcast::new();
        b.put(CycleScope::All, Namespace::Root, "job runner", "background");
        b.put(CycleScope::All, Namespace::Named("foo".into()), "execution time limit", "PT1H");
        let resolved = b.resolve_all("foo", &CyclePoint::integer(1));
        assert_eq!(resolved.get("job runner").map(String::as_str), Some("background"));
        assert_eq!(resolved.get("execution time limit").map(String::as_str), Some("PT1H"));
    }

    #[test]
    fn snapshot_restore_round_trip_preserves_precedence() {
        let mut b = Broadcast::new();
        b.put(CycleScope::All, Namespace::Root, "job runner", "background");
        b.put(CycleScope::All, Namespace::Root, "job runner", "at");
        let snapshot = b.snapshot().unwrap();

        let mut restored = Broadcast::new();
        restored.restore(&snapshot).unwrap();
        assert_eq!(restored.get("foo", &CyclePoint::integer(1), "job runner"), Some("at"));

        // a `put` after restore must still win over everything restored.
        restored.put(CycleScope::All, Namespace::Root, "job runner", "slurm");
        assert_eq!(restored.get("foo", &CyclePoint::integer(1), "job runner"), Some("slurm"));
    }
}
