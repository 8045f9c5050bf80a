//! prepared statement bookkeeping.
//!
//! Tracks how often each `(query, parameter types)` pair was executed and
//! promotes it to a server side prepared statement once it crosses the
//! threshold. The cache is LRU bounded; evicting a prepared entry schedules
//! a `DEALLOCATE`, and statements invalidated wholesale (DDL, rollback)
//! schedule a `DEALLOCATE ALL`.

use lru::LruCache;
use postgres_types::Oid;

use super::{
    pq::{ExecStatus, PqResult},
    queries::PostgresQuery,
};

/// what the executor should do with the statement at hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prepare {
    /// execute without preparing
    No,
    /// already prepared under the returned name
    Yes,
    /// prepare under the returned name, then execute
    Should,
}

type Key = (Vec<u8>, Vec<Oid>);

enum Entry {
    Seen(u32),
    Prepared(Vec<u8>),
}

pub(crate) struct PrepareManager {
    /// number of executions before a query is prepared. `None` disables
    /// preparing, 0 prepares on first use.
    pub(crate) prepare_threshold: Option<u32>,
    /// bound on cache entries.
    pub(crate) prepared_max: usize,
    cache: LruCache<Key, Entry>,
    name_idx: u64,
}

impl PrepareManager {
    pub(crate) fn new() -> Self {
        Self {
            prepare_threshold: Some(5),
            prepared_max: 100,
            cache: LruCache::unbounded(),
            name_idx: 0,
        }
    }

    pub(crate) fn key(query: &PostgresQuery) -> Key {
        (query.query.clone(), query.types())
    }

    /// decide how to execute *query*, returning the statement name to use.
    pub(crate) fn get(&mut self, query: &PostgresQuery, prepare: Option<bool>) -> (Prepare, Vec<u8>) {
        if prepare == Some(false) || self.prepare_threshold.is_none() {
            return (Prepare::No, Vec::new());
        }

        let key = Self::key(query);
        match self.cache.peek(&key) {
            Some(Entry::Prepared(name)) => (Prepare::Yes, name.clone()),
            entry => {
                let count = match entry {
                    Some(Entry::Seen(n)) => *n,
                    _ => 0,
                };
                if count >= self.prepare_threshold.unwrap_or(u32::MAX) || prepare == Some(true) {
                    let name = format!("_pg3_{}", self.name_idx).into_bytes();
                    self.name_idx += 1;
                    (Prepare::Should, name)
                } else {
                    (Prepare::No, Vec::new())
                }
            }
        }
    }

    /// update the cache after an execution. The returned command, if any,
    /// must be executed on the connection to keep the server in sync.
    pub(crate) fn maintain<R: PqResult>(
        &mut self,
        key: Key,
        results: &[R],
        prep: Prepare,
        name: &[u8],
    ) -> Option<Vec<u8>> {
        self.prepare_threshold?;

        // a DROP or a ROLLBACK may invalidate statements prepared on the
        // session: the same object can be recreated and the backend would
        // then fail its internal lookups.
        if !self.cache.is_empty() || prep == Prepare::Should {
            for result in results {
                if result.status() != ExecStatus::CommandOk {
                    continue;
                }
                let Some(tag) = result.command_status() else { continue };
                if tag.starts_with("DROP ") || tag == "ROLLBACK" {
                    self.cache.clear();
                    return Some(b"DEALLOCATE ALL".to_vec());
                }
            }
        }

        if let Some(entry) = self.cache.get_mut(&key) {
            match entry {
                Entry::Seen(_) if prep == Prepare::Should => *entry = Entry::Prepared(name.to_vec()),
                Entry::Seen(n) => *n += 1,
                Entry::Prepared(_) => {}
            }
            return None;
        }

        // a multiple statement cannot be prepared
        if results.len() != 1 {
            return None;
        }
        let status = results[0].status();
        if status != ExecStatus::CommandOk && status != ExecStatus::TuplesOk {
            // failed queries and other weird results are not worth tracking
            return None;
        }

        let entry = if prep == Prepare::Should {
            Entry::Prepared(name.to_vec())
        } else {
            Entry::Seen(1)
        };
        self.cache.put(key, entry);

        if self.cache.len() <= self.prepared_max {
            return None;
        }
        match self.cache.pop_lru() {
            Some((_, Entry::Prepared(old))) => {
                let mut cmd = b"DEALLOCATE ".to_vec();
                cmd.extend_from_slice(&old);
                Some(cmd)
            }
            _ => None,
        }
    }

    /// deferred bookkeeping for pipeline mode, applied once the results of
    /// an enqueued execution arrive.
    pub(crate) fn validate<R: PqResult>(
        &mut self,
        key: Key,
        prep: Prepare,
        name: &[u8],
        results: &[R],
    ) -> Option<Vec<u8>> {
        self.maintain(key, results, prep, name)
    }

    /// forget everything. called on rollback; the deallocation is only
    /// needed if some statement was ever actually prepared.
    pub(crate) fn clear(&mut self) -> Option<Vec<u8>> {
        if self.name_idx > 0 {
            self.cache.clear();
            self.name_idx = 0;
            Some(b"DEALLOCATE ALL".to_vec())
        } else {
            None
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::pq::mock::MockResult;
    use crate::queries::{Params, Query};
    use crate::transform::Transformer;
    use crate::types::default_adapters;
    use std::sync::Arc;

    fn query(text: &str, n: i32) -> PostgresQuery {
        let mut tx = Transformer::new(Arc::new(default_adapters()), SessionInfo::default());
        PostgresQuery::convert(&Query::from(text), Some(&Params::positional([n])), &mut tx)
            .unwrap()
    }

    fn ok() -> Vec<MockResult> {
        vec![MockResult::tuples(Vec::new(), Vec::new())]
    }

    #[test]
    fn threshold_crossing_promotes_to_prepared() {
        let mut mgr = PrepareManager::new();
        mgr.prepare_threshold = Some(3);
        let q = query("select %s", 1);

        for _ in 0..3 {
            let (prep, name) = mgr.get(&q, None);
            assert_eq!(prep, Prepare::No);
            assert!(mgr.maintain(PrepareManager::key(&q), &ok(), prep, &name).is_none());
        }

        let (prep, name) = mgr.get(&q, None);
        assert_eq!(prep, Prepare::Should);
        assert_eq!(name, b"_pg3_0".to_vec());
        mgr.maintain(PrepareManager::key(&q), &ok(), prep, &name);

        let (prep, name) = mgr.get(&q, None);
        assert_eq!(prep, Prepare::Yes);
        assert_eq!(name, b"_pg3_0".to_vec());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn different_param_types_are_different_statements() {
        let mut mgr = PrepareManager::new();
        mgr.prepare_threshold = Some(1);
        let q1 = query("select %s", 1);

        let mut tx = Transformer::new(Arc::new(default_adapters()), SessionInfo::default());
        let q2 = PostgresQuery::convert(
            &Query::from("select %s"),
            Some(&Params::positional(["x"])),
            &mut tx,
        )
        .unwrap();

        let (p1, n1) = mgr.get(&q1, None);
        mgr.maintain(PrepareManager::key(&q1), &ok(), p1, &n1);
        let (p2, _) = mgr.get(&q2, None);
        assert_eq!(p2, Prepare::No, "other oid tuple starts its own tally");
    }

    #[test]
    fn forced_prepare_skips_the_tally() {
        let mut mgr = PrepareManager::new();
        let q = query("select %s", 1);
        let (prep, _) = mgr.get(&q, Some(true));
        assert_eq!(prep, Prepare::Should);
        let (prep, _) = mgr.get(&q, Some(false));
        assert_eq!(prep, Prepare::No);
    }

    #[test]
    fn zero_threshold_prepares_first_use() {
        let mut mgr = PrepareManager::new();
        mgr.prepare_threshold = Some(0);
        let q = query("select %s", 1);
        let (prep, _) = mgr.get(&q, None);
        assert_eq!(prep, Prepare::Should);
    }

    #[test]
    fn drop_tag_flushes_cache() {
        let mut mgr = PrepareManager::new();
        mgr.prepare_threshold = Some(0);
        let q = query("select %s", 1);
        let (prep, name) = mgr.get(&q, None);
        mgr.maintain(PrepareManager::key(&q), &ok(), prep, &name);
        assert_eq!(mgr.len(), 1);

        let drop = query("drop table t -- %s", 1);
        let results = vec![MockResult::command_ok("DROP TABLE")];
        let cmd = mgr.maintain(PrepareManager::key(&drop), &results, Prepare::No, b"");
        assert_eq!(cmd, Some(b"DEALLOCATE ALL".to_vec()));
        assert_eq!(mgr.len(), 0);
    }

    #[test]
    fn clear_resets_counter_and_deallocates_once() {
        let mut mgr = PrepareManager::new();
        mgr.prepare_threshold = Some(0);
        let q = query("select %s", 1);
        let (prep, name) = mgr.get(&q, None);
        mgr.maintain(PrepareManager::key(&q), &ok(), prep, &name);

        assert_eq!(mgr.clear(), Some(b"DEALLOCATE ALL".to_vec()));
        assert_eq!(mgr.clear(), None, "nothing was prepared since");

        // the counter restarted: the next name is _pg3_0 again
        let (_, name) = mgr.get(&q, Some(true));
        assert_eq!(name, b"_pg3_0".to_vec());
    }

    #[test]
    fn lru_eviction_deallocates_prepared_entries() {
        let mut mgr = PrepareManager::new();
        mgr.prepare_threshold = Some(0);
        mgr.prepared_max = 2;

        let queries: Vec<PostgresQuery> =
            (0..3).map(|i| query(&format!("select {i} + %s"), i)).collect();
        let mut cmds = Vec::new();
        for q in &queries {
            let (prep, name) = mgr.get(q, None);
            if let Some(cmd) = mgr.maintain(PrepareManager::key(q), &ok(), prep, &name) {
                cmds.push(cmd);
            }
        }
        assert_eq!(mgr.len(), 2);
        assert_eq!(cmds, vec![b"DEALLOCATE _pg3_0".to_vec()]);
    }

    #[test]
    fn multi_statement_results_are_not_cached() {
        let mut mgr = PrepareManager::new();
        mgr.prepare_threshold = Some(0);
        let q = query("select %s", 1);
        let results = vec![
            MockResult::tuples(Vec::new(), Vec::new()),
            MockResult::tuples(Vec::new(), Vec::new()),
        ];
        mgr.maintain(PrepareManager::key(&q), &results, Prepare::No, b"");
        assert_eq!(mgr.len(), 0);
    }
}
