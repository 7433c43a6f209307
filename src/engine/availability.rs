use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Free sub-intervals of `window` not covered by any `busy` interval.
///
/// `busy` must be sorted by start; entries may overlap each other and may
/// stick out of the window. Gaps narrower than `min_duration` are dropped.
/// Runs in one pass over `busy`.
pub fn free_slots(busy: &[TimeRange], window: &TimeRange, min_duration: Secs) -> Vec<TimeRange> {
    let mut free = Vec::new();
    let mut cursor = window.start;

    for b in busy {
        if b.start >= window.end {
            break;
        }
        if b.end <= cursor {
            continue;
        }
        if b.start > cursor {
            push_gap(&mut free, cursor, b.start, min_duration);
        }
        cursor = cursor.max(b.end);
        if cursor >= window.end {
            return free;
        }
    }

    push_gap(&mut free, cursor, window.end, min_duration);
    free
}

fn push_gap(free: &mut Vec<TimeRange>, start: Secs, end: Secs, min_duration: Secs) {
    if start < end && end - start >= min_duration {
        free.push(TimeRange::new(start, end));
    }
}

/// Caller overrides for a free-slot query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityQuery {
    pub window: TimeRange,
    pub min_duration: Secs,
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Secs = 3600;
    const M: Secs = 60;

    fn r(start: Secs, end: Secs) -> TimeRange {
        TimeRange::new(start, end)
    }

    fn day() -> TimeRange {
        r(8 * H, 17 * H)
    }

    #[test]
    fn no_bookings_whole_window_free() {
        assert_eq!(free_slots(&[], &day(), 0), vec![day()]);
    }

    #[test]
    fn complement_of_two_bookings() {
        let busy = [r(9 * H, 10 * H), r(13 * H, 14 * H)];
        assert_eq!(
            free_slots(&busy, &day(), 0),
            vec![r(8 * H, 9 * H), r(10 * H, 13 * H), r(14 * H, 17 * H)]
        );
    }

    #[test]
    fn booking_covering_window_leaves_nothing() {
        assert!(free_slots(&[day()], &day(), 0).is_empty());
        assert!(free_slots(&[r(7 * H, 18 * H)], &day(), 0).is_empty());
    }

    #[test]
    fn booking_straddling_window_start_is_clamped() {
        let busy = [r(7 * H, 9 * H)];
        assert_eq!(free_slots(&busy, &day(), 0), vec![r(9 * H, 17 * H)]);
    }

    #[test]
    fn booking_straddling_window_end_is_clamped() {
        let busy = [r(16 * H, 18 * H)];
        assert_eq!(free_slots(&busy, &day(), 0), vec![r(8 * H, 16 * H)]);
    }

    #[test]
    fn bookings_outside_window_ignored() {
        let busy = [r(6 * H, 7 * H), r(18 * H, 19 * H)];
        assert_eq!(free_slots(&busy, &day(), 0), vec![day()]);
    }

    #[test]
    fn overlapping_busy_intervals_merge() {
        let busy = [r(9 * H, 11 * H), r(10 * H, 10 * H + 30 * M), r(10 * H + 45 * M, 12 * H)];
        assert_eq!(
            free_slots(&busy, &day(), 0),
            vec![r(8 * H, 9 * H), r(12 * H, 17 * H)]
        );
    }

    #[test]
    fn back_to_back_leaves_no_gap() {
        let busy = [r(9 * H, 10 * H), r(10 * H, 11 * H)];
        assert_eq!(
            free_slots(&busy, &day(), 0),
            vec![r(8 * H, 9 * H), r(11 * H, 17 * H)]
        );
    }

    #[test]
    fn gaps_below_granularity_dropped() {
        // 15-minute gap between lessons is too small for a 30-minute granularity.
        let busy = [r(8 * H, 9 * H), r(9 * H + 15 * M, 16 * H + 40 * M)];
        assert!(free_slots(&busy, &day(), 30 * M).is_empty());
        assert_eq!(
            free_slots(&busy, &day(), 15 * M),
            vec![r(9 * H, 9 * H + 15 * M)]
        );
    }

    #[test]
    fn sub_hour_bookings_handled() {
        let busy = [r(8 * H + 10 * M, 8 * H + 50 * M)];
        assert_eq!(
            free_slots(&busy, &day(), 0),
            vec![r(8 * H, 8 * H + 10 * M), r(8 * H + 50 * M, 17 * H)]
        );
    }
}
