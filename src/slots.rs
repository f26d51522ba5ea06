//! Slot generation: a pure function of its inputs, including `now`.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::calendar::BusinessCalendar;
use crate::model::{DayInterval, MINUTE_MS, Ms, Slot, Span};
use crate::overlap::Timed;

pub const DEFAULT_GRID_MINUTES: u32 = 30;
pub const DEFAULT_LEAD_TIME_MINUTES: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotParams {
    pub grid: u32,
    pub duration: u32,
    /// Minimum gap between `now` and a same-day slot.
    pub lead_time: u32,
    pub now: Ms,
}

/// Bookable start times on `date`, ascending and unique.
///
/// Candidates sit on grid multiples of the local minute-of-day and must fit
/// entirely inside one interval. A candidate is dropped when its full
/// `[start, start + duration)` overlaps any busy range; touching a busy range
/// at either end is fine. On the local date of `now`, candidates starting
/// before `now + lead_time` are dropped; earlier dates yield nothing.
pub fn generate<B: Timed>(
    intervals: &[DayInterval],
    busy: &[B],
    date: NaiveDate,
    params: &SlotParams,
    calendar: &BusinessCalendar,
) -> Vec<Slot> {
    if params.grid == 0 || params.duration == 0 {
        return Vec::new();
    }
    let today = calendar.date_of(params.now);
    if today.is_some_and(|today| date < today) {
        return Vec::new();
    }
    let earliest = (today == Some(date)).then(|| params.now + params.lead_time as Ms * MINUTE_MS);
    let busy: Vec<Span> = busy.iter().map(Timed::span).collect();
    let length = params.duration as Ms * MINUTE_MS;

    let mut slots: BTreeMap<Ms, Slot> = BTreeMap::new();
    for interval in intervals {
        let mut minute = align_up(interval.start, params.grid);
        while minute + params.duration <= interval.end {
            if let Some(start) = calendar.instant(date, minute) {
                let candidate = Span::new(start, start + length);
                let free = !busy.iter().any(|b| b.overlaps(&candidate));
                let early = earliest.is_some_and(|e| start < e);
                if free && !early {
                    slots.entry(start).or_insert(Slot { start, minute });
                }
            }
            minute += params.grid;
        }
    }
    slots.into_values().collect()
}

fn align_up(minute: u32, grid: u32) -> u32 {
    minute.div_ceil(grid) * grid
}
