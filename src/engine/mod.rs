mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{free_slots, AvailabilityQuery};
pub use conflict::{find_batch_conflict, find_conflict};
pub use error::{ConflictReport, EngineError};

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::directory::ResourceDirectory;
use crate::index::{IndexError, IntervalIndex, PartitionGuards};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{BOOKINGS_ACTIVE, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // Non-append commands only run once the appends ahead of them are durable
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("wal writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal flush of {} events failed: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Timetable store plus its interval index, conflict checker and change feed.
///
/// Writers lock the partitions a booking occupies (old and new placement) in
/// `PartitionKey` order, check for clashes, append to the WAL and apply, all
/// under those locks. Readers take partition read locks and never see a
/// half-applied write.
pub struct Engine {
    records: Arc<DashMap<Ulid, Booking>>,
    pub index: IntervalIndex,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    directory: Arc<dyn ResourceDirectory>,
    config: EngineConfig,
    /// Shared by commits, exclusive for compaction snapshots.
    commit_gate: Arc<RwLock<()>>,
}

/// Apply an event to records and index. The caller holds write guards on
/// every partition `event_keys` names for this event.
fn apply_event(
    records: &DashMap<Ulid, Booking>,
    guards: &mut PartitionGuards,
    event: &Event,
) -> Result<(), IndexError> {
    match event {
        Event::BookingCreated { booking } => store_booking(records, guards, booking),
        Event::BookingsImported { bookings } => {
            for booking in bookings {
                store_booking(records, guards, booking)?;
            }
            Ok(())
        }
        Event::BookingUpdated { booking } => {
            let previous = records.get(&booking.id).map(|r| r.value().clone());
            if let Some(old) = previous
                && old.is_active
            {
                unindex(guards, &old)?;
            }
            store_booking(records, guards, booking)
        }
        Event::BookingDeactivated { id, at } => {
            let Some(mut record) = records.get_mut(id) else {
                return Err(IndexError::MissingEntry(*id));
            };
            if record.is_active {
                unindex(guards, &record)?;
                record.is_active = false;
                record.updated_at = *at;
            }
            Ok(())
        }
        Event::BookingDeleted { id } => {
            if let Some((_, old)) = records.remove(id)
                && old.is_active
            {
                unindex(guards, &old)?;
            }
            Ok(())
        }
    }
}

fn store_booking(
    records: &DashMap<Ulid, Booking>,
    guards: &mut PartitionGuards,
    booking: &Booking,
) -> Result<(), IndexError> {
    if booking.is_active {
        for key in booking.partition_keys() {
            guards.get_mut(&key)?.insert(booking.id, booking.range)?;
        }
    }
    records.insert(booking.id, booking.clone());
    Ok(())
}

fn unindex(guards: &mut PartitionGuards, booking: &Booking) -> Result<(), IndexError> {
    for key in booking.partition_keys() {
        guards.get_mut(&key)?.remove(booking.id)?;
    }
    Ok(())
}

/// Partitions an event touches: the previous placement of the record (if
/// active) plus the placement it writes.
fn event_keys(records: &DashMap<Ulid, Booking>, event: &Event) -> Vec<PartitionKey> {
    let active_keys = |id: &Ulid| {
        records
            .get(id)
            .filter(|r| r.is_active)
            .map(|r| r.partition_keys().to_vec())
            .unwrap_or_default()
    };
    match event {
        Event::BookingCreated { booking } => booking.partition_keys().to_vec(),
        Event::BookingsImported { bookings } => bookings.iter().flat_map(|b| b.partition_keys()).collect(),
        Event::BookingUpdated { booking } => {
            let mut keys = active_keys(&booking.id);
            keys.extend(booking.partition_keys());
            keys
        }
        Event::BookingDeactivated { id, .. } | Event::BookingDeleted { id } => active_keys(id),
    }
}

/// Change in the active-booking count an applied event causes.
fn active_delta(event: &Event) -> f64 {
    match event {
        Event::BookingCreated { booking } => booking.is_active as u8 as f64,
        Event::BookingsImported { bookings } => bookings.len() as f64,
        Event::BookingDeactivated { .. } | Event::BookingDeleted { .. } => -1.0,
        Event::BookingUpdated { .. } => 0.0,
    }
}

/// Write event to WAL via the background group-commit writer.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        directory: Arc<dyn ResourceDirectory>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            records: Arc::new(DashMap::new()),
            index: IntervalIndex::new(),
            wal_tx,
            notify,
            directory,
            config,
            commit_gate: Arc::new(RwLock::new(())),
        };

        // Replay through the same apply path as live writes. We're the sole
        // owner here, so try-locks always succeed; never block_on inside a runtime.
        for event in &events {
            let keys = event_keys(&engine.records, event);
            let mut guards = engine.index.try_lock_write(&keys).ok_or_else(|| {
                io::Error::new(io::ErrorKind::WouldBlock, "replay: partition lock contended")
            })?;
            apply_event(&engine.records, &mut guards, event).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("replay of {} diverged: {e}", wal_path.display()),
                )
            })?;
        }

        let active = engine.active_booking_count();
        metrics::gauge!(BOOKINGS_ACTIVE).set(active as f64);
        tracing::info!(
            "replayed {} events from {}: {} bookings ({active} active)",
            events.len(),
            wal_path.display(),
            engine.records.len()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// WAL-append + apply + notify under the caller's partition guards.
    ///
    /// Runs as its own task so a caller that is cancelled mid-commit cannot
    /// leave the log ahead of the in-memory state.
    pub(super) async fn persist_and_apply(&self, mut guards: PartitionGuards, event: Event) -> Result<(), EngineError> {
        let gate = self.commit_gate.clone().read_owned().await;
        let records = self.records.clone();
        let wal_tx = self.wal_tx.clone();
        let notify = self.notify.clone();

        let commit = tokio::spawn(async move {
            let _gate = gate;
            wal_append(&wal_tx, &event).await?;
            if let Err(e) = apply_event(&records, &mut guards, &event) {
                tracing::error!("index out of step with log after {event:?}: {e}");
                return Err(EngineError::StoreUnavailable(e.to_string()));
            }
            // One event per class or teacher, however many days it spans
            let resources: BTreeSet<(ResourceKind, Ulid)> =
                guards.keys().map(|key| (key.kind, key.resource_id)).collect();
            for (kind, resource_id) in resources {
                notify.send(kind, resource_id, &event);
            }
            metrics::gauge!(BOOKINGS_ACTIVE).increment(active_delta(&event));
            Ok(())
        });

        commit
            .await
            .map_err(|e| EngineError::StoreUnavailable(format!("commit task failed: {e}")))?
    }

    /// Resolve the class, teacher and subject a booking references.
    pub(super) async fn check_references(
        &self,
        class_id: Option<Ulid>,
        teacher_id: Option<Ulid>,
        subject_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if let Some(id) = class_id {
            self.directory.resolve_class(id).await?;
        }
        if let Some(id) = teacher_id {
            self.directory.resolve_teacher(id).await?;
        }
        if let Some(id) = subject_id {
            self.directory.resolve_subject(id).await?;
        }
        Ok(())
    }

    /// Resolve a class or teacher by kind.
    pub(super) async fn check_resource(&self, kind: ResourceKind, id: Ulid) -> Result<(), EngineError> {
        match kind {
            ResourceKind::Class => self.check_references(Some(id), None, None).await,
            ResourceKind::Teacher => self.check_references(None, Some(id), None).await,
        }
    }

    pub fn booking_count(&self) -> usize {
        self.records.len()
    }

    pub fn active_booking_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_active).count()
    }
}
