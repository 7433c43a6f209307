use std::collections::HashMap;

use ulid::Ulid;

use crate::index::PartitionLookup;
use crate::limits::*;
use crate::model::*;

use super::{ConflictReport, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_range(start: Secs, end: Secs) -> Result<TimeRange, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start {} must be before end {}",
            format_time(start),
            format_time(end)
        )));
    }
    TimeRange::try_new(start, end)
        .ok_or_else(|| EngineError::Validation(format!("end {} is past 24:00", format_time(end))))
}

fn validate_labels(academic_year: &str, room: Option<&str>, semester: Option<&str>) -> Result<(), EngineError> {
    if academic_year.trim().is_empty() {
        return Err(EngineError::Validation("academic year is required".into()));
    }
    if academic_year.len() > MAX_ACADEMIC_YEAR_LEN {
        return Err(EngineError::LimitExceeded("academic year label too long"));
    }
    if room.is_some_and(|r| r.len() > MAX_ROOM_LEN) {
        return Err(EngineError::LimitExceeded("room label too long"));
    }
    if semester.is_some_and(|s| s.len() > MAX_SEMESTER_LEN) {
        return Err(EngineError::LimitExceeded("semester tag too long"));
    }
    Ok(())
}

/// Validate a create request and turn it into a booking record.
pub(crate) fn build_booking(new: NewBooking, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
    let range = validate_range(new.start, new.end)?;
    validate_labels(&new.academic_year, new.room.as_deref(), new.semester.as_deref())?;
    Ok(Booking {
        id,
        class_id: new.class_id,
        teacher_id: new.teacher_id,
        subject_id: new.subject_id,
        day: new.day,
        range,
        room: new.room,
        academic_year: new.academic_year.trim().to_string(),
        semester: new.semester,
        is_active: true,
        created_by: new.created_by,
        created_at: now,
        updated_at: now,
    })
}

/// Merge `patch` over `current`. `id`, `created_by` and `created_at` never change.
pub(crate) fn merge_patch(current: &Booking, patch: &BookingPatch, now: Ms) -> Result<Booking, EngineError> {
    let start = patch.start.unwrap_or(current.range.start);
    let end = patch.end.unwrap_or(current.range.end);
    let range = validate_range(start, end)?;

    let mut merged = current.clone();
    merged.range = range;
    if let Some(id) = patch.class_id {
        merged.class_id = id;
    }
    if let Some(id) = patch.teacher_id {
        merged.teacher_id = id;
    }
    if let Some(id) = patch.subject_id {
        merged.subject_id = id;
    }
    if let Some(day) = patch.day {
        merged.day = day;
    }
    if let Some(room) = &patch.room {
        merged.room = room.clone();
    }
    if let Some(year) = &patch.academic_year {
        merged.academic_year = year.trim().to_string();
    }
    if let Some(semester) = &patch.semester {
        merged.semester = semester.clone();
    }
    validate_labels(&merged.academic_year, merged.room.as_deref(), merged.semester.as_deref())?;
    merged.updated_at = now;
    Ok(merged)
}

/// Check `candidate` against the class and teacher timelines it would occupy.
///
/// `exclude` is the candidate's own id when updating, so a booking never
/// conflicts with its previous self. Class is checked before teacher.
pub fn find_conflict(
    partitions: &impl PartitionLookup,
    candidate: &Booking,
    exclude: Option<Ulid>,
) -> Option<ConflictReport> {
    let checks = [
        (ResourceKind::Class, candidate.class_id, candidate.class_key()),
        (ResourceKind::Teacher, candidate.teacher_id, candidate.teacher_key()),
    ];
    for (kind, resource_id, key) in checks {
        let Some(partition) = partitions.partition(&key) else {
            continue;
        };
        if let Some(hit) = partition.first_overlap(&candidate.range, exclude) {
            return Some(ConflictReport {
                kind,
                resource_id,
                booking_id: hit.booking_id,
            });
        }
    }
    None
}

/// Pairwise check inside a batch; reports the earlier booking of the first clashing pair.
pub fn find_batch_conflict(batch: &[Booking]) -> Option<ConflictReport> {
    for (i, a) in batch.iter().enumerate() {
        for b in &batch[i + 1..] {
            if let Some(kind) = b.clashes_with(a) {
                let resource_id = match kind {
                    ResourceKind::Class => a.class_id,
                    ResourceKind::Teacher => a.teacher_id,
                };
                return Some(ConflictReport {
                    kind,
                    resource_id,
                    booking_id: a.id,
                });
            }
        }
    }
    None
}

/// Reject writes that would grow a partition past its cap. `keys` lists one
/// entry per booking being added, so a key may repeat.
pub(crate) fn check_partition_room(partitions: &impl PartitionLookup, keys: &[PartitionKey]) -> Result<(), EngineError> {
    let mut adding: HashMap<&PartitionKey, usize> = HashMap::new();
    for key in keys {
        *adding.entry(key).or_default() += 1;
    }
    for (key, count) in adding {
        let len = partitions.partition(key).map_or(0, |p| p.len());
        if len + count > MAX_BOOKINGS_PER_PARTITION {
            return Err(EngineError::LimitExceeded("too many bookings for one resource on one day"));
        }
    }
    Ok(())
}
