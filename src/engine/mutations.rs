use std::collections::HashSet;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::CONFLICTS_TOTAL;

use super::conflict::{build_booking, check_partition_room, find_batch_conflict, find_conflict, merge_patch, now_ms};
use super::{ConflictReport, Engine, EngineError, WalCommand};

fn reject(report: ConflictReport) -> EngineError {
    metrics::counter!(CONFLICTS_TOTAL, "kind" => report.kind.as_str()).increment(1);
    tracing::debug!("rejected booking: {report}");
    EngineError::Conflict(report)
}

impl Engine {
    pub async fn create_booking(&self, new: NewBooking) -> Result<Booking, EngineError> {
        let booking = build_booking(new, Ulid::new(), now_ms())?;
        self.check_references(Some(booking.class_id), Some(booking.teacher_id), Some(booking.subject_id))
            .await?;

        let keys = booking.partition_keys();
        let guards = self.index.lock_write(&keys).await;
        check_partition_room(&guards, &keys)?;
        if let Some(report) = find_conflict(&guards, &booking, None) {
            return Err(reject(report));
        }

        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(guards, event).await?;
        Ok(booking)
    }

    /// Create several bookings atomically. All-or-nothing: if any booking
    /// clashes with the store or with another in the batch, none are committed.
    pub async fn create_bookings(&self, batch: Vec<NewBooking>) -> Result<Vec<Booking>, EngineError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let now = now_ms();
        let bookings = batch
            .into_iter()
            .map(|new| build_booking(new, Ulid::new(), now))
            .collect::<Result<Vec<_>, _>>()?;

        // One directory lookup per distinct reference
        let (mut classes, mut teachers, mut subjects) = (HashSet::new(), HashSet::new(), HashSet::new());
        for b in &bookings {
            let class_id = classes.insert(b.class_id).then_some(b.class_id);
            let teacher_id = teachers.insert(b.teacher_id).then_some(b.teacher_id);
            let subject_id = subjects.insert(b.subject_id).then_some(b.subject_id);
            self.check_references(class_id, teacher_id, subject_id).await?;
        }

        if let Some(report) = find_batch_conflict(&bookings) {
            return Err(reject(report));
        }

        let keys: Vec<PartitionKey> = bookings.iter().flat_map(|b| b.partition_keys()).collect();
        let guards = self.index.lock_write(&keys).await;
        check_partition_room(&guards, &keys)?;
        for b in &bookings {
            if let Some(report) = find_conflict(&guards, b, None) {
                return Err(reject(report));
            }
        }

        let event = Event::BookingsImported { bookings: bookings.clone() };
        self.persist_and_apply(guards, event).await?;
        Ok(bookings)
    }

    /// Apply `patch` to an active booking. The booking never conflicts with
    /// its own previous placement; on rejection the old placement stays.
    pub async fn update_booking(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, EngineError> {
        self.check_references(patch.class_id, patch.teacher_id, patch.subject_id)
            .await?;

        for _ in 0..MAX_LOCK_RETRIES {
            let current = self.active_record(id)?;
            let updated = merge_patch(&current, &patch, now_ms())?;

            let old_keys = current.partition_keys();
            let new_keys = updated.partition_keys();
            let mut keys = old_keys.to_vec();
            keys.extend(new_keys.iter().cloned());
            let guards = self.index.lock_write(&keys).await;

            // Someone else moved or retired the booking while we waited
            if !self.record_unchanged(&current) {
                drop(guards);
                continue;
            }

            let growing: Vec<PartitionKey> = new_keys.into_iter().filter(|k| !old_keys.contains(k)).collect();
            check_partition_room(&guards, &growing)?;
            if let Some(report) = find_conflict(&guards, &updated, Some(id)) {
                return Err(reject(report));
            }

            let event = Event::BookingUpdated { booking: updated.clone() };
            self.persist_and_apply(guards, event).await?;
            return Ok(updated);
        }
        Err(EngineError::StoreUnavailable(format!("booking {id} kept changing under update")))
    }

    /// Soft delete: the record stays but leaves the index.
    pub async fn deactivate_booking(&self, id: Ulid) -> Result<(), EngineError> {
        self.retire(id, |booking| Event::BookingDeactivated {
            id: booking.id,
            at: now_ms(),
        })
        .await
    }

    /// Hard delete: the record and its index entries are removed.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        self.retire(id, |booking| Event::BookingDeleted { id: booking.id }).await
    }

    async fn retire(&self, id: Ulid, event: impl Fn(&Booking) -> Event) -> Result<(), EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let current = self.active_record(id)?;
            let guards = self.index.lock_write(&current.partition_keys()).await;
            if !self.record_unchanged(&current) {
                drop(guards);
                continue;
            }
            return self.persist_and_apply(guards, event(&current)).await;
        }
        Err(EngineError::StoreUnavailable(format!("booking {id} kept changing under removal")))
    }

    fn active_record(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.records
            .get(&id)
            .filter(|r| r.is_active)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    fn record_unchanged(&self, snapshot: &Booking) -> bool {
        self.records.get(&snapshot.id).is_some_and(|r| *r.value() == *snapshot)
    }

    /// Rewrite the WAL as one event per live record. Commits wait on the gate
    /// while the snapshot is taken and the compacted file is swapped in.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut bookings: Vec<Booking> = self.records.iter().map(|r| r.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        let events: Vec<Event> = bookings.into_iter().map(|booking| Event::BookingCreated { booking }).collect();
        let retained = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        tracing::info!("compacted WAL to {retained} bookings");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
