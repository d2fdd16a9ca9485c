//! Bounded in-memory snapshot history
//!
//! One FIFO ring per match, bounded by snapshot count and by tick age.
//! History survives pause and is cleared on container stop.

use std::collections::VecDeque;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::delta::DeltaSnapshot;
use crate::error::{EngineError, Result};
use crate::snapshot::Snapshot;

/// Retention summary for one match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryInfo {
    pub match_id: u64,
    pub retained: usize,
    pub oldest_tick: Option<u64>,
    pub newest_tick: Option<u64>,
}

/// Per-match snapshot ring buffers.
pub struct SnapshotHistory {
    per_match: AHashMap<u64, VecDeque<Snapshot>>,
    max_snapshots: usize,
    max_age_ticks: u64,
}

impl SnapshotHistory {
    pub fn new(max_snapshots: usize, max_age_ticks: u64) -> Self {
        Self {
            per_match: AHashMap::new(),
            max_snapshots: max_snapshots.max(1),
            max_age_ticks: max_age_ticks.max(1),
        }
    }

    /// Store a value copy; evicts FIFO when the ring is full.
    pub fn record(&mut self, snapshot: Snapshot) {
        let ring = self.per_match.entry(snapshot.match_id).or_default();

        // Re-recording the same tick replaces the entry
        if let Some(last) = ring.back_mut() {
            if last.tick == snapshot.tick {
                *last = snapshot;
                return;
            }
        }

        while ring.len() >= self.max_snapshots {
            ring.pop_front();
        }
        trace!(match_id = snapshot.match_id, tick = snapshot.tick, "snapshot recorded");
        ring.push_back(snapshot);
    }

    pub fn get(&self, match_id: u64, tick: u64) -> Option<&Snapshot> {
        self.per_match
            .get(&match_id)?
            .iter()
            .find(|snapshot| snapshot.tick == tick)
    }

    /// Delta between two retained ticks.
    pub fn delta(&self, match_id: u64, from_tick: u64, to_tick: u64) -> Result<DeltaSnapshot> {
        let from = self
            .get(match_id, from_tick)
            .ok_or(EngineError::SnapshotNotInHistory { match_id, tick: from_tick })?;
        let to = self
            .get(match_id, to_tick)
            .ok_or(EngineError::SnapshotNotInHistory { match_id, tick: to_tick })?;
        DeltaSnapshot::between(from, to)
    }

    /// Age-based eviction, called after each tick.
    pub fn evict_older_than(&mut self, current_tick: u64) {
        let horizon = current_tick.saturating_sub(self.max_age_ticks);
        for ring in self.per_match.values_mut() {
            while ring.front().map(|s| s.tick < horizon).unwrap_or(false) {
                ring.pop_front();
            }
        }
    }

    pub fn info(&self, match_id: u64) -> HistoryInfo {
        let ring = self.per_match.get(&match_id);
        HistoryInfo {
            match_id,
            retained: ring.map(VecDeque::len).unwrap_or(0),
            oldest_tick: ring.and_then(|r| r.front()).map(|s| s.tick),
            newest_tick: ring.and_then(|r| r.back()).map(|s| s.tick),
        }
    }

    pub fn retained(&self, match_id: u64) -> usize {
        self.per_match.get(&match_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn clear_match(&mut self, match_id: u64) {
        self.per_match.remove(&match_id);
    }

    pub fn clear(&mut self) {
        self.per_match.clear();
    }

    /// Coarse memory estimate for budget accounting.
    pub fn estimated_bytes(&self) -> usize {
        self.per_match
            .values()
            .flat_map(|ring| ring.iter())
            .map(|snapshot| {
                snapshot.entity_ids.len() * 8 + snapshot.field_slot_count() * 16
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use std::collections::BTreeMap;

    fn snap(match_id: u64, tick: u64) -> Snapshot {
        Snapshot {
            match_id,
            tick,
            entity_ids: Vec::new(),
            modules: BTreeMap::new(),
        }
    }

    #[test]
    fn test_record_and_get() {
        let mut history = SnapshotHistory::new(4, 1000);
        history.record(snap(1, 0));
        history.record(snap(1, 1));
        history.record(snap(2, 0));

        assert!(history.get(1, 0).is_some());
        assert!(history.get(1, 1).is_some());
        assert!(history.get(2, 1).is_none());
        assert_eq!(history.retained(1), 2);
    }

    #[test]
    fn test_fifo_eviction_by_count() {
        let mut history = SnapshotHistory::new(2, 1000);
        history.record(snap(1, 0));
        history.record(snap(1, 1));
        history.record(snap(1, 2));

        assert!(history.get(1, 0).is_none());
        assert!(history.get(1, 1).is_some());
        assert!(history.get(1, 2).is_some());

        let info = history.info(1);
        assert_eq!(info.oldest_tick, Some(1));
        assert_eq!(info.newest_tick, Some(2));
    }

    #[test]
    fn test_eviction_by_age() {
        let mut history = SnapshotHistory::new(100, 5);
        for tick in 0..10 {
            history.record(snap(1, tick));
        }
        history.evict_older_than(10);

        assert!(history.get(1, 4).is_none());
        assert!(history.get(1, 5).is_some());
        assert!(history.get(1, 9).is_some());
    }

    #[test]
    fn test_same_tick_replaces() {
        let mut history = SnapshotHistory::new(4, 1000);
        history.record(snap(1, 3));
        history.record(snap(1, 3));
        assert_eq!(history.retained(1), 1);
    }

    #[test]
    fn test_delta_requires_retained_ticks() {
        let mut history = SnapshotHistory::new(4, 1000);
        history.record(snap(1, 0));

        assert!(matches!(
            history.delta(1, 0, 9),
            Err(EngineError::SnapshotNotInHistory { match_id: 1, tick: 9 })
        ));
    }

    #[test]
    fn test_clear_on_stop() {
        let mut history = SnapshotHistory::new(4, 1000);
        history.record(snap(1, 0));
        history.record(snap(2, 0));
        history.clear();
        assert_eq!(history.retained(1), 0);
        assert_eq!(history.retained(2), 0);
    }
}
