use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use hostmon_common::types::AgentResult;
use hostmon_plugin::ResultWriter;
use tokio::sync::Notify;

struct ResultBuffer {
    results: VecDeque<AgentResult>,
    max_size: usize,
    persistent: usize,
    max_persistent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    Stored,
    /// Stored after discarding the oldest ordinary result.
    Evicted,
    Rejected,
}

impl ResultBuffer {
    fn push(&mut self, result: AgentResult) -> Push {
        if result.persistent && self.persistent >= self.max_persistent {
            return Push::Rejected;
        }
        let mut outcome = Push::Stored;
        if self.results.len() >= self.max_size {
            // Oldest non-persistent result goes first.
            match self.results.iter().position(|r| !r.persistent) {
                Some(pos) => {
                    self.results.remove(pos);
                    outcome = Push::Evicted;
                }
                None => return Push::Rejected,
            }
        }
        if result.persistent {
            self.persistent += 1;
        }
        self.results.push_back(result);
        outcome
    }

    fn persist_slots(&self) -> usize {
        let free = self.max_persistent.saturating_sub(self.persistent);
        free.min(self.max_size.saturating_sub(self.persistent))
    }

    fn drain_all(&mut self) -> Vec<AgentResult> {
        self.persistent = 0;
        self.results.drain(..).collect()
    }
}

/// Bounded outbound buffer shared by every result writer user.
///
/// When full, the oldest ordinary result is discarded. Persistent results
/// (log positions) are never evicted, but at most `max_persistent` of them
/// are held; plugins producing them consult
/// [`ResultWriter::persist_slots_available`] and skip a run instead of
/// having a result rejected.
pub struct ResultCache {
    buffer: Mutex<ResultBuffer>,
    flush_requested: Notify,
}

impl ResultCache {
    pub fn new(max_size: usize, max_persistent: usize) -> Self {
        Self {
            buffer: Mutex::new(ResultBuffer {
                results: VecDeque::with_capacity(max_size),
                max_size,
                persistent: 0,
                max_persistent,
            }),
            flush_requested: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResultBuffer> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn drain_all(&self) -> Vec<AgentResult> {
        self.lock().drain_all()
    }

    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once a writer asked for an early flush.
    pub async fn flush_requested(&self) {
        self.flush_requested.notified().await;
    }
}

impl ResultWriter for ResultCache {
    fn write(&self, result: AgentResult) {
        let itemid = result.itemid;
        let persistent = result.persistent;
        match self.lock().push(result) {
            Push::Stored => {}
            Push::Evicted => tracing::warn!(itemid, "Result cache full, oldest result dropped"),
            Push::Rejected => {
                tracing::warn!(itemid, persistent, "Result cache full, result dropped");
            }
        }
    }

    fn flush(&self) {
        self.flush_requested.notify_one();
    }

    fn slots_available(&self) -> usize {
        let buffer = self.lock();
        buffer.max_size.saturating_sub(buffer.results.len())
    }

    fn persist_slots_available(&self) -> usize {
        self.lock().persist_slots()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn persistent(itemid: u64) -> AgentResult {
        AgentResult {
            persistent: true,
            last_log_size: Some(100),
            ..AgentResult::value(itemid, "line")
        }
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let cache = ResultCache::new(2, 2);
        cache.write(AgentResult::value(1, "a"));
        cache.write(AgentResult::value(2, "b"));
        assert_eq!(cache.slots_available(), 0);
        cache.write(AgentResult::value(3, "c"));

        let ids: Vec<_> = cache.drain_all().iter().map(|r| r.itemid).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(cache.is_empty());
        assert_eq!(cache.slots_available(), 2);
    }

    #[test]
    fn test_persistent_results_survive_overflow() {
        let cache = ResultCache::new(2, 1);
        cache.write(persistent(1));
        assert_eq!(cache.persist_slots_available(), 0);
        cache.write(AgentResult::value(2, "b"));
        cache.write(AgentResult::value(3, "c"));

        let ids: Vec<_> = cache.drain_all().iter().map(|r| r.itemid).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(cache.persist_slots_available(), 1);
    }

    #[test]
    fn test_ordinary_result_dropped_when_only_persistent_buffered() {
        let cache = ResultCache::new(1, 4);
        cache.write(persistent(1));
        cache.write(AgentResult::value(2, "b"));

        let results = cache.drain_all();
        assert_eq!(results.len(), 1);
        assert!(results[0].persistent);
    }

    #[test]
    fn test_persistent_results_are_capped() {
        let cache = ResultCache::new(4, 2);
        cache.write(persistent(1));
        cache.write(persistent(2));
        assert_eq!(cache.persist_slots_available(), 0);
        cache.write(persistent(3));

        let ids: Vec<_> = cache.drain_all().iter().map(|r| r.itemid).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(cache.persist_slots_available(), 2);
    }

    #[test]
    fn test_persistent_results_never_exceed_buffer_size() {
        let cache = ResultCache::new(2, 4);
        cache.write(AgentResult::value(1, "a"));
        cache.write(persistent(2));
        assert_eq!(cache.persist_slots_available(), 1);
        cache.write(persistent(3));
        assert_eq!(cache.persist_slots_available(), 0);
        cache.write(persistent(4));

        let ids: Vec<_> = cache.drain_all().iter().map(|r| r.itemid).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_flush_wakes_waiter() {
        let cache = Arc::new(ResultCache::new(4, 4));
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.flush_requested().await })
        };
        cache.write(AgentResult::value(1, "a"));
        cache.flush();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("flush should wake the waiter")
            .unwrap();
        assert_eq!(cache.len(), 1);
    }
}
