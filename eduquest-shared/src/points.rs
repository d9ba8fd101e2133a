//! Points policy: how many points a finished task is worth, and when an
//! unfinished task counts as overdue.
//!
//! Both checks are pure functions of the task's dates and the current date,
//! so the server can evaluate them inside a storage transaction and tests
//! can pin the clock.

use chrono::{NaiveDate, NaiveDateTime};

use crate::domain::{Difficulty, TaskStatus};

/// Each difficulty step is worth this many points.
pub const POINTS_PER_DIFFICULTY: i32 = 10;

/// Deducted when execution straddles the due date.
pub const STRADDLE_PENALTY: i32 = 5;

pub fn base_points(difficulty: Difficulty) -> i32 {
    difficulty.0 * POINTS_PER_DIFFICULTY
}

/// True when the task was started on or before its due date but finished
/// strictly after it. Finishing on the due date itself is on time.
///
/// A task that was never started cannot straddle anything.
pub fn straddles_due_date(
    started_at: Option<NaiveDateTime>,
    finished_at: NaiveDateTime,
    due_date: NaiveDate,
) -> bool {
    match started_at {
        Some(started) => started.date() <= due_date && finished_at.date() > due_date,
        None => false,
    }
}

/// Points awarded for a finish at `finished_at`. Missing preference is
/// expressed as difficulty 0 and scores 0; it is not an error.
pub fn award(
    difficulty: Difficulty,
    started_at: Option<NaiveDateTime>,
    finished_at: NaiveDateTime,
    due_date: NaiveDate,
) -> i32 {
    let base = base_points(difficulty);
    if straddles_due_date(started_at, finished_at, due_date) {
        (base - STRADDLE_PENALTY).max(0)
    } else {
        base
    }
}

/// Whether a task in `status` should be reclassified as overdue on a read
/// happening on `today`. Only live states are swept; `Done` is terminal, so
/// a task finished on time can never become overdue afterwards.
pub fn should_sweep_overdue(status: TaskStatus, due_date: NaiveDate, today: NaiveDate) -> bool {
    matches!(status, TaskStatus::ToDo | TaskStatus::Started) && due_date < today
}
