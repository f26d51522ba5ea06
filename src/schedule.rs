use chrono::NaiveDate;

use crate::calendar::BusinessCalendar;
use crate::limits::MAX_INTERVALS_PER_DAY;
use crate::model::{DayInterval, DaySchedule, MINUTES_PER_DAY};

/// Read access to the weekly template, by weekday (0 = Sunday).
pub trait ScheduleSource {
    fn day(&self, weekday: u8) -> Option<&DaySchedule>;

    /// Intervals that apply on `date`; empty when the weekday is disabled or
    /// unconfigured.
    fn intervals_for(&self, date: NaiveDate) -> Vec<DayInterval> {
        match self.day(BusinessCalendar::weekday(date)) {
            Some(day) if day.enabled => day.intervals.clone(),
            _ => Vec::new(),
        }
    }
}

/// The fixed weekly schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    days: [DaySchedule; 7],
}

impl Schedule {
    pub fn set_day(&mut self, weekday: u8, day: DaySchedule) {
        if let Some(slot) = self.days.get_mut(weekday as usize) {
            *slot = day;
        }
    }

    /// Configured weekdays, for snapshotting.
    pub fn days(&self) -> impl Iterator<Item = (u8, &DaySchedule)> {
        self.days.iter().enumerate().map(|(i, d)| (i as u8, d))
    }
}

impl ScheduleSource for Schedule {
    fn day(&self, weekday: u8) -> Option<&DaySchedule> {
        self.days.get(weekday as usize)
    }
}

/// Sort and validate a weekday's intervals: each within the day, non-empty,
/// and pairwise non-overlapping. Touching intervals are allowed.
pub fn normalize_day(
    weekday: u8,
    enabled: bool,
    mut intervals: Vec<DayInterval>,
) -> Result<DaySchedule, String> {
    if weekday > 6 {
        return Err(format!("weekday {weekday} out of range 0..=6"));
    }
    if intervals.len() > MAX_INTERVALS_PER_DAY {
        return Err(format!("at most {MAX_INTERVALS_PER_DAY} intervals per day"));
    }
    for iv in &intervals {
        if iv.start >= iv.end || iv.end > MINUTES_PER_DAY {
            return Err(format!("invalid interval {}..{}", iv.start, iv.end));
        }
    }
    intervals.sort_by_key(|iv| iv.start);
    for pair in intervals.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(format!("intervals {} and {} overlap", pair[0], pair[1]));
        }
    }
    Ok(DaySchedule { enabled, intervals })
}

/// Parse `"09:00-12:00,13:00-17:30"`. An empty string yields no intervals.
pub fn parse_intervals(text: &str) -> Result<Vec<DayInterval>, String> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (start, end) = part
                .split_once('-')
                .ok_or_else(|| format!("expected HH:MM-HH:MM, got {part:?}"))?;
            let start = parse_hhmm(start.trim())?;
            let end = parse_hhmm(end.trim())?;
            if start >= end {
                return Err(format!("interval {part:?} is empty or reversed"));
            }
            Ok(DayInterval::new(start, end))
        })
        .collect()
}

/// Parse `"HH:MM"` into a minute-of-day. `"24:00"` is accepted as end of day.
pub fn parse_hhmm(text: &str) -> Result<u32, String> {
    let (h, m) = text
        .split_once(':')
        .ok_or_else(|| format!("expected HH:MM, got {text:?}"))?;
    let h: u32 = h.parse().map_err(|_| format!("bad hour in {text:?}"))?;
    let m: u32 = m.parse().map_err(|_| format!("bad minute in {text:?}"))?;
    if m >= 60 {
        return Err(format!("bad minute in {text:?}"));
    }
    let minute = h * 60 + m;
    if minute > MINUTES_PER_DAY {
        return Err(format!("{text:?} is past end of day"));
    }
    Ok(minute)
}
