use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Seconds since midnight. The only time-of-day type.
pub type Secs = u32;

/// Unix milliseconds, used for audit timestamps only.
pub type Ms = i64;

/// One full day. Valid only as an end bound.
pub const DAY_SECS: Secs = 24 * 3600;

/// Half-open interval `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Secs,
    pub end: Secs,
}

impl TimeRange {
    pub fn new(start: Secs, end: Secs) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Secs, end: Secs) -> Option<Self> {
        (start < end && end <= DAY_SECS).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Secs {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_time(self.start), format_time(self.end))
    }
}

/// `HH:MM`, or `HH:MM:SS` when the seconds are non-zero.
pub fn format_time(t: Secs) -> String {
    let (h, m, s) = (t / 3600, (t % 3600) / 60, t % 60);
    if s == 0 {
        format!("{h:02}:{m:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

/// Parse `HH:MM` or `HH:MM:SS`. `24:00` is accepted (end-of-day bound).
pub fn parse_time(s: &str) -> Result<Secs, String> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(format!("bad time of day: {s:?} (expected HH:MM or HH:MM:SS)"));
    }
    let field = |p: &str, max: u32| -> Result<u32, String> {
        let v: u32 = p
            .parse()
            .map_err(|_| format!("bad time of day: {s:?}"))?;
        if v > max {
            return Err(format!("bad time of day: {s:?}"));
        }
        Ok(v)
    };
    let h = field(parts[0], 24)?;
    let m = field(parts[1], 59)?;
    let sec = match parts.get(2) {
        Some(p) => field(p, 59)?,
        None => 0,
    };
    let total = h * 3600 + m * 60 + sec;
    if total > DAY_SECS {
        return Err(format!("time of day past 24:00: {s:?}"));
    }
    Ok(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
        DayOfWeek::Saturday,
        DayOfWeek::Sunday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DayOfWeek::Monday => "monday",
            DayOfWeek::Tuesday => "tuesday",
            DayOfWeek::Wednesday => "wednesday",
            DayOfWeek::Thursday => "thursday",
            DayOfWeek::Friday => "friday",
            DayOfWeek::Saturday => "saturday",
            DayOfWeek::Sunday => "sunday",
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DayOfWeek {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        DayOfWeek::ALL
            .into_iter()
            .find(|d| d.as_str() == lower || d.as_str()[..3] == lower)
            .ok_or_else(|| format!("unknown day of week: {s:?}"))
    }
}

/// The two kinds of resource whose time cannot be double-booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Class,
    Teacher,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Class => "class",
            ResourceKind::Teacher => "teacher",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "class" => Ok(ResourceKind::Class),
            "teacher" => Ok(ResourceKind::Teacher),
            _ => Err(format!("unknown resource kind: {s:?} (expected class or teacher)")),
        }
    }
}

/// Unit of independent indexing and locking.
///
/// Field order matters: the derived `Ord` is the global lock acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub academic_year: String,
    pub day: DayOfWeek,
    pub kind: ResourceKind,
    pub resource_id: Ulid,
}

impl PartitionKey {
    pub fn new(academic_year: &str, day: DayOfWeek, kind: ResourceKind, resource_id: Ulid) -> Self {
        Self {
            academic_year: academic_year.to_string(),
            day,
            kind,
            resource_id,
        }
    }
}

/// A weekly recurring class/teacher/room assignment, scoped to an academic year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub class_id: Ulid,
    pub teacher_id: Ulid,
    pub subject_id: Ulid,
    pub day: DayOfWeek,
    pub range: TimeRange,
    pub room: Option<String>,
    pub academic_year: String,
    pub semester: Option<String>,
    pub is_active: bool,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn class_key(&self) -> PartitionKey {
        PartitionKey::new(&self.academic_year, self.day, ResourceKind::Class, self.class_id)
    }

    pub fn teacher_key(&self) -> PartitionKey {
        PartitionKey::new(&self.academic_year, self.day, ResourceKind::Teacher, self.teacher_id)
    }

    /// Class partition first, then teacher.
    pub fn partition_keys(&self) -> [PartitionKey; 2] {
        [self.class_key(), self.teacher_key()]
    }

    /// True if both bookings compete for the same class or teacher at the same time.
    pub fn clashes_with(&self, other: &Booking) -> Option<ResourceKind> {
        if self.academic_year != other.academic_year
            || self.day != other.day
            || !self.range.overlaps(&other.range)
        {
            return None;
        }
        if self.class_id == other.class_id {
            Some(ResourceKind::Class)
        } else if self.teacher_id == other.teacher_id {
            Some(ResourceKind::Teacher)
        } else {
            None
        }
    }
}

/// Input to create. The engine assigns `id` and audit fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub class_id: Ulid,
    pub teacher_id: Ulid,
    pub subject_id: Ulid,
    pub day: DayOfWeek,
    pub start: Secs,
    pub end: Secs,
    pub room: Option<String>,
    pub academic_year: String,
    pub semester: Option<String>,
    pub created_by: Ulid,
}

/// Partial update. `room` and `semester` use a nested `Option` so they can be cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub class_id: Option<Ulid>,
    pub teacher_id: Option<Ulid>,
    pub subject_id: Option<Ulid>,
    pub day: Option<DayOfWeek>,
    pub start: Option<Secs>,
    pub end: Option<Secs>,
    pub room: Option<Option<String>>,
    pub academic_year: Option<String>,
    pub semester: Option<Option<String>>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        *self == BookingPatch::default()
    }
}

/// Committed changes, one per WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    /// All-or-nothing batch create, persisted as one record.
    BookingsImported {
        bookings: Vec<Booking>,
    },
    BookingUpdated {
        booking: Booking,
    },
    BookingDeactivated {
        id: Ulid,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimetableEntry {
    pub booking: Booking,
    pub class_name: Option<String>,
    pub teacher_name: Option<String>,
    pub subject_name: Option<String>,
}

/// Weekly view for one class or teacher. Always holds all seven days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timetable {
    pub kind: ResourceKind,
    pub resource_id: Ulid,
    pub academic_year: String,
    pub days: BTreeMap<DayOfWeek, Vec<TimetableEntry>>,
}

impl Timetable {
    pub fn empty(kind: ResourceKind, resource_id: Ulid, academic_year: &str) -> Self {
        Self {
            kind,
            resource_id,
            academic_year: academic_year.to_string(),
            days: DayOfWeek::ALL.into_iter().map(|d| (d, Vec::new())).collect(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }
}
