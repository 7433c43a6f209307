use std::collections::HashMap;

use ulid::Ulid;

use crate::directory::{DirectoryError, DisplayRecord};
use crate::limits::*;
use crate::model::*;

use super::availability::{free_slots, AvailabilityQuery};
use super::{Engine, EngineError};

/// Per-call memo of directory names, so a timetable with many lessons of the
/// same subject resolves it once.
#[derive(Default)]
struct NameCache {
    classes: HashMap<Ulid, Option<String>>,
    teachers: HashMap<Ulid, Option<String>>,
    subjects: HashMap<Ulid, Option<String>>,
}

/// Unknown ids project as `None`; an unreachable directory fails the query.
fn display_name(result: Result<DisplayRecord, DirectoryError>) -> Result<Option<String>, EngineError> {
    match result {
        Ok(record) => Ok(Some(record.name)),
        Err(DirectoryError::NotFound(..)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Engine {
    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.records
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Active bookings of a class in one academic year, ordered by day then start.
    pub async fn list_by_class(&self, class_id: Ulid, academic_year: &str) -> Vec<Booking> {
        self.list_active(ResourceKind::Class, class_id, academic_year).await
    }

    /// Active bookings of a teacher in one academic year, ordered by day then start.
    pub async fn list_by_teacher(&self, teacher_id: Ulid, academic_year: &str) -> Vec<Booking> {
        self.list_active(ResourceKind::Teacher, teacher_id, academic_year).await
    }

    async fn list_active(&self, kind: ResourceKind, resource_id: Ulid, academic_year: &str) -> Vec<Booking> {
        let mut keys: Vec<PartitionKey> = DayOfWeek::ALL
            .into_iter()
            .map(|day| PartitionKey::new(academic_year.trim(), day, kind, resource_id))
            .collect();
        keys.sort();

        // Hold every day at once, in writer lock order, so a booking moving
        // between days is seen before or after the move, never both or neither.
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(partition) = self.index.get(key) {
                guards.push(partition.read_owned().await);
            }
        }

        guards
            .iter()
            .flat_map(|guard| guard.entries().iter())
            .filter_map(|e| self.records.get(&e.booking_id).map(|r| r.value().clone()))
            .collect()
    }

    pub async fn class_timetable(&self, class_id: Ulid, academic_year: &str) -> Result<Timetable, EngineError> {
        self.timetable(ResourceKind::Class, class_id, academic_year).await
    }

    pub async fn teacher_timetable(&self, teacher_id: Ulid, academic_year: &str) -> Result<Timetable, EngineError> {
        self.timetable(ResourceKind::Teacher, teacher_id, academic_year).await
    }

    /// Week view of a resource: all seven days present, each sorted by start,
    /// with display names resolved through the directory.
    async fn timetable(&self, kind: ResourceKind, resource_id: Ulid, academic_year: &str) -> Result<Timetable, EngineError> {
        self.check_resource(kind, resource_id).await?;
        let bookings = self.list_active(kind, resource_id, academic_year).await;

        let mut names = NameCache::default();
        let mut timetable = Timetable::empty(kind, resource_id, academic_year.trim());
        for booking in bookings {
            let entry = self.project(booking, &mut names).await?;
            timetable.days.entry(entry.booking.day).or_default().push(entry);
        }
        Ok(timetable)
    }

    async fn project(&self, booking: Booking, names: &mut NameCache) -> Result<TimetableEntry, EngineError> {
        let class_name = match names.classes.get(&booking.class_id) {
            Some(name) => name.clone(),
            None => {
                let name = display_name(self.directory.resolve_class(booking.class_id).await)?;
                names.classes.insert(booking.class_id, name.clone());
                name
            }
        };
        let teacher_name = match names.teachers.get(&booking.teacher_id) {
            Some(name) => name.clone(),
            None => {
                let name = display_name(self.directory.resolve_teacher(booking.teacher_id).await)?;
                names.teachers.insert(booking.teacher_id, name.clone());
                name
            }
        };
        let subject_name = match names.subjects.get(&booking.subject_id) {
            Some(name) => name.clone(),
            None => {
                let name = display_name(self.directory.resolve_subject(booking.subject_id).await)?;
                names.subjects.insert(booking.subject_id, name.clone());
                name
            }
        };
        Ok(TimetableEntry {
            booking,
            class_name,
            teacher_name,
            subject_name,
        })
    }

    /// Free slots of a resource inside the configured school day.
    pub async fn available_slots(
        &self,
        kind: ResourceKind,
        resource_id: Ulid,
        day: DayOfWeek,
        academic_year: &str,
    ) -> Result<Vec<TimeRange>, EngineError> {
        let query = AvailabilityQuery {
            window: self.config.window,
            min_duration: self.config.granularity,
        };
        self.available_slots_with(kind, resource_id, day, academic_year, query).await
    }

    pub async fn available_slots_with(
        &self,
        kind: ResourceKind,
        resource_id: Ulid,
        day: DayOfWeek,
        academic_year: &str,
        query: AvailabilityQuery,
    ) -> Result<Vec<TimeRange>, EngineError> {
        validate_query(academic_year, &query)?;
        self.check_resource(kind, resource_id).await?;

        let key = PartitionKey::new(academic_year.trim(), day, kind, resource_id);
        let busy: Vec<TimeRange> = self.index.list_sorted(&key).await.into_iter().map(|e| e.range).collect();
        Ok(free_slots(&busy, &query.window, query.min_duration))
    }

    /// Slots free for every listed resource at once, e.g. a class and the
    /// teacher who would take it.
    pub async fn common_slots(
        &self,
        resources: &[(ResourceKind, Ulid)],
        day: DayOfWeek,
        academic_year: &str,
        query: Option<AvailabilityQuery>,
    ) -> Result<Vec<TimeRange>, EngineError> {
        if resources.is_empty() {
            return Err(EngineError::Validation("no resources given".into()));
        }
        if resources.len() > MAX_COMMON_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources in query"));
        }
        let query = query.unwrap_or(AvailabilityQuery {
            window: self.config.window,
            min_duration: self.config.granularity,
        });
        validate_query(academic_year, &query)?;

        let mut busy = Vec::new();
        for &(kind, resource_id) in resources {
            self.check_resource(kind, resource_id).await?;
            let key = PartitionKey::new(academic_year.trim(), day, kind, resource_id);
            busy.extend(self.index.list_sorted(&key).await.into_iter().map(|e| e.range));
        }
        busy.sort_by_key(|r| r.start);
        Ok(free_slots(&busy, &query.window, query.min_duration))
    }
}

fn validate_query(academic_year: &str, query: &AvailabilityQuery) -> Result<(), EngineError> {
    if academic_year.trim().is_empty() {
        return Err(EngineError::Validation("academic year is required".into()));
    }
    if query.window.start >= query.window.end || query.window.end > DAY_SECS {
        return Err(EngineError::Validation(format!("empty availability window {}", query.window)));
    }
    Ok(())
}
