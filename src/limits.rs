/// Max length of an academic year label, e.g. "2024-2025".
pub const MAX_ACADEMIC_YEAR_LEN: usize = 32;

/// Max length of a room label.
pub const MAX_ROOM_LEN: usize = 64;

/// Max length of a semester tag.
pub const MAX_SEMESTER_LEN: usize = 32;

/// Max length of a class/teacher/subject display name.
pub const MAX_NAME_LEN: usize = 256;

/// Max bookings in one all-or-nothing import.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Max active bookings in one (year, day, resource) partition.
pub const MAX_BOOKINGS_PER_PARTITION: usize = 256;

/// Max resources in one common-availability query.
pub const MAX_COMMON_RESOURCES: usize = 64;

/// How often a writer re-reads a booking that moved while it waited for locks.
pub const MAX_LOCK_RETRIES: usize = 16;
