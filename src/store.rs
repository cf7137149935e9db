//! Store: sled-backed persistence sufficient to reconstruct TaskProxy
//! state, Broadcast settings, and memoized xtrigger results after a restart.
//!
//! Grounded directly in `knhk-workflow-engine/src/state.rs`'s `StateStore`
//! (`sled::Db`, `"prefix:key"` naming, `serde_json` serialization, every
//! operation wrapped in the crate's own error type).

use std::path::Path;

use sled::Db;

use crate::error::SchedulerResult;
use crate::task_proxy::{ProxyId, TaskProxy};

pub struct Store {
    db: Db,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> SchedulerResult<Self> {
        let db = sled::open(path)?;
        Ok(Store { db })
    }

    pub fn open_temporary() -> SchedulerResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Store { db })
    }

    pub fn save_proxy(&self, proxy: &TaskProxy) -> SchedulerResult<()> {
        let key = format!("proxy:{}", proxy.id);
        let value = serde_json::to_vec(proxy)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn remove_proxy(&self, id: &ProxyId) -> SchedulerResult<()> {
        let key = format!("proxy:{id}");
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn load_all_proxies(&self) -> SchedulerResult<Vec<TaskProxy>> {
        let mut proxies = Vec::new();
        for result in self.db.scan_prefix(b"proxy:") {
            let (_, value) = result?;
            proxies.push(serde_json::from_slice(&value)?);
        }
        Ok(proxies)
    }

    pub fn save_broadcast_snapshot(&self, snapshot: &[u8]) -> SchedulerResult<()> {
        self.db.insert(b"broadcast:snapshot", snapshot)?;
        Ok(())
    }

    pub fn load_broadcast_snapshot(&self) -> SchedulerResult<Option<Vec<u8>>> {
        Ok(self.db.get(b"broadcast:snapshot")?.map(|v| v.to_vec()))
    }

    pub fn save_xtrigger_result(&self, label: &str, satisfied: bool) -> SchedulerResult<()> {
        let key = format!("xtrigger:{label}");
        self.db.insert(key.as_bytes(), vec![satisfied as u8])?;
        Ok(())
    }

    pub fn load_xtrigger_results(&self) -> SchedulerResult<Vec<(String, bool)>> {
        let mut out = Vec::new();
        for result in self.db.scan_prefix(b"xtrigger:") {
            let (key, value) = result?;
            let label = String::from_utf8_lossy(&key["xtrigger:".len()..]).to_string();
            let satisfied = value.first().map(|b| *b != 0).unwrap_or(false);
            out.push((label, satisfied));
        }
        Ok(out)
    }

    pub fn flush(&self) -> SchedulerResult<()> {
        self.db.flush()?;
        Ok(())
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

    #[test]
    fn round_trips_a_proxy() {
        let store = Store::open_temporary().unwrap();
        let p = CyclePoint::integer(1);
        let prereq = Prerequisite::parse("", &p, None, &AllKnown).unwrap();
        let proxy = TaskProxy::new(
            ProxyId {
                name: "foo".into(),
                cycle: p,
                flow_tag: 1,
            },
            prereq,
        );
        store.save_proxy(&proxy).unwrap();
        let loaded = store.load_all_proxies().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, proxy.id);
    }

    #[test]
    fn removed_proxy_is_not_reloaded() {
        let store = Store::open_temporary().unwrap();
        let p = CyclePoint::integer(1);
        let prereq = Prerequisite::parse("", &p, None, &AllKnown).unwrap();
        let proxy = TaskProxy::new(
            ProxyId {
                name: "foo".into(),
                cycle: p,
                flow_tag: 1,
            },
            prereq,
        );
        store.save_proxy(&proxy).unwrap();
        store.remove_proxy(&proxy.id).unwrap();
        assert!(store.load_all_proxies().unwrap().is_empty());
    }

    #[test]
    fn xtrigger_results_round_trip() {
        let store = Store::open_temporary().unwrap();
        store.save_xtrigger_result("wall_clock(offset=PT1H)", true).unwrap();
        let results = store.load_xtrigger_results().unwrap();
        assert_eq!(results, vec![("wall_clock(offset=PT1H)".to_string(), true)]);
    }
}
