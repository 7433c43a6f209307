use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedPartition = Arc<RwLock<Partition>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub booking_id: Ulid,
    pub range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    DuplicateEntry(Ulid),
    MissingEntry(Ulid),
    NotLocked(PartitionKey),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::DuplicateEntry(id) => write!(f, "booking {id} already indexed"),
            IndexError::MissingEntry(id) => write!(f, "booking {id} not indexed"),
            IndexError::NotLocked(key) => write!(
                f,
                "partition {} {} {} {} not locked",
                key.academic_year, key.day, key.kind, key.resource_id
            ),
        }
    }
}

impl std::error::Error for IndexError {}

/// Active bookings of one resource on one day of one academic year.
///
/// `entries` is sorted by `range.start`; `max_end[i]` is the largest end among
/// `entries[..=i]`, which lets overlap searches stop walking left early.
#[derive(Debug, Default, Clone)]
pub struct Partition {
    entries: Vec<IndexEntry>,
    max_end: Vec<Secs>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by start time.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn contains(&self, booking_id: Ulid) -> bool {
        self.entries.iter().any(|e| e.booking_id == booking_id)
    }

    /// Insert maintaining sort order by start. Equal starts keep insertion order.
    pub fn insert(&mut self, booking_id: Ulid, range: TimeRange) -> Result<(), IndexError> {
        if self.contains(booking_id) {
            return Err(IndexError::DuplicateEntry(booking_id));
        }
        let pos = self.entries.partition_point(|e| e.range.start <= range.start);
        self.entries.insert(pos, IndexEntry { booking_id, range });
        self.max_end.insert(pos, range.end);
        self.rebuild_max_end(pos);
        Ok(())
    }

    pub fn remove(&mut self, booking_id: Ulid) -> Result<TimeRange, IndexError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.booking_id == booking_id)
            .ok_or(IndexError::MissingEntry(booking_id))?;
        let removed = self.entries.remove(pos);
        self.max_end.remove(pos);
        self.rebuild_max_end(pos);
        Ok(removed.range)
    }

    /// First stored interval intersecting the half-open `query`, skipping `exclude`.
    pub fn first_overlap(&self, query: &TimeRange, exclude: Option<Ulid>) -> Option<&IndexEntry> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.entries.partition_point(|e| e.range.start < query.end);
        for i in (0..right_bound).rev() {
            if self.max_end[i] <= query.start {
                break;
            }
            let entry = &self.entries[i];
            if entry.range.end > query.start && Some(entry.booking_id) != exclude {
                return Some(entry);
            }
        }
        None
    }

    pub fn overlaps(&self, query: &TimeRange, exclude: Option<Ulid>) -> bool {
        self.first_overlap(query, exclude).is_some()
    }

    fn rebuild_max_end(&mut self, from: usize) {
        let mut running = if from == 0 { 0 } else { self.max_end[from - 1] };
        for i in from..self.entries.len() {
            running = running.max(self.entries[i].range.end);
            self.max_end[i] = running;
        }
    }
}

/// Read access to locked partitions, keyed by `PartitionKey`.
pub trait PartitionLookup {
    fn partition(&self, key: &PartitionKey) -> Option<&Partition>;
}

/// Write guards over a set of partitions, held in `PartitionKey` order.
pub struct PartitionGuards {
    guards: Vec<(PartitionKey, OwnedRwLockWriteGuard<Partition>)>,
}

impl PartitionGuards {
    pub fn keys(&self) -> impl Iterator<Item = &PartitionKey> {
        self.guards.iter().map(|(k, _)| k)
    }

    fn position(&self, key: &PartitionKey) -> Option<usize> {
        self.guards.binary_search_by(|(k, _)| k.cmp(key)).ok()
    }

    pub fn get_mut(&mut self, key: &PartitionKey) -> Result<&mut Partition, IndexError> {
        let pos = self
            .position(key)
            .ok_or_else(|| IndexError::NotLocked(key.clone()))?;
        Ok(&mut *self.guards[pos].1)
    }
}

impl PartitionLookup for PartitionGuards {
    fn partition(&self, key: &PartitionKey) -> Option<&Partition> {
        self.position(key).map(|pos| &*self.guards[pos].1)
    }
}

/// Partitioned interval index over active bookings.
///
/// Partitions are created on first use and never removed: the partition's
/// lock is the mutual-exclusion scope for its key, so replacing the `Arc`
/// would let two writers hold different locks for the same key.
#[derive(Default)]
pub struct IntervalIndex {
    partitions: DashMap<PartitionKey, SharedPartition>,
}

impl IntervalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn get(&self, key: &PartitionKey) -> Option<SharedPartition> {
        self.partitions.get(key).map(|e| e.value().clone())
    }

    fn get_or_create(&self, key: &PartitionKey) -> SharedPartition {
        self.partitions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Partition::new())))
            .value()
            .clone()
    }

    /// Lookups on a missing key are empty, not an error.
    pub async fn overlaps(&self, key: &PartitionKey, query: &TimeRange, exclude: Option<Ulid>) -> Option<Ulid> {
        let partition = self.get(key)?;
        let guard = partition.read().await;
        guard.first_overlap(query, exclude).map(|e| e.booking_id)
    }

    /// Fresh snapshot of a partition, ordered by start.
    pub async fn list_sorted(&self, key: &PartitionKey) -> Vec<IndexEntry> {
        match self.get(key) {
            Some(partition) => partition.read().await.entries().to_vec(),
            None => Vec::new(),
        }
    }

    /// Acquire write locks on `keys` in sorted order to prevent deadlocks.
    pub async fn lock_write(&self, keys: &[PartitionKey]) -> PartitionGuards {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            let guard = self.get_or_create(&key).write_owned().await;
            guards.push((key, guard));
        }
        PartitionGuards { guards }
    }

    /// Non-blocking variant for replay, where the caller is the sole owner.
    pub(crate) fn try_lock_write(&self, keys: &[PartitionKey]) -> Option<PartitionGuards> {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            let guard = self.get_or_create(&key).try_write_owned().ok()?;
            guards.push((key, guard));
        }
        Some(PartitionGuards { guards })
    }
}
