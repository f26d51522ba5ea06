//! Conversion between absolute instants and the business-local calendar.
//!
//! Minute-of-day integers are always local to the business timezone. They are
//! turned into absolute [`Ms`] here and nowhere else, so DST handling lives in
//! one place:
//! - a local time inside a spring-forward gap does not exist and maps to `None`;
//! - an ambiguous local time (fall-back) maps to its earliest instant.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessCalendar {
    tz: Tz,
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl BusinessCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Absolute instant of `minute` past local midnight on `date`.
    pub fn instant(&self, date: NaiveDate, minute: u32) -> Option<Ms> {
        let midnight = date.and_time(NaiveTime::MIN);
        let local = midnight.checked_add_signed(Duration::minutes(minute as i64))?;
        match self.tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => Some(dt.timestamp_millis()),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
            LocalResult::None => None,
        }
    }

    /// The absolute window covered by local `date`, from its first to the next
    /// day's first existing instant.
    pub fn day_span(&self, date: NaiveDate) -> Option<Span> {
        let start = self.first_instant(date)?;
        let end = self.first_instant(date.succ_opt()?)?;
        Some(Span::new(start, end))
    }

    /// Local date an instant falls on.
    pub fn date_of(&self, t: Ms) -> Option<NaiveDate> {
        self.local(t).map(|dt| dt.date_naive())
    }

    /// Local minute-of-day an instant falls on.
    pub fn minute_of(&self, t: Ms) -> Option<u32> {
        self.local(t).map(|dt| dt.hour() * 60 + dt.minute())
    }

    /// 0 = Sunday … 6 = Saturday.
    pub fn weekday(date: NaiveDate) -> u8 {
        date.weekday().num_days_from_sunday() as u8
    }

    fn local(&self, t: Ms) -> Option<DateTime<Tz>> {
        Utc.timestamp_millis_opt(t)
            .single()
            .map(|utc| utc.with_timezone(&self.tz))
    }

    fn first_instant(&self, date: NaiveDate) -> Option<Ms> {
        // Midnight itself can fall in a DST gap in some zones; walk forward.
        (0..=120).step_by(15).find_map(|m| self.instant(date, m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn utc_instant_and_back() {
        let cal = BusinessCalendar::default();
        let t = cal.instant(d(2025, 1, 10), 9 * 60 + 30).unwrap();
        assert_eq!(t, 1_736_501_400_000);
        assert_eq!(cal.date_of(t), Some(d(2025, 1, 10)));
        assert_eq!(cal.minute_of(t), Some(570));
    }

    #[test]
    fn day_span_is_24h_in_utc() {
        let cal = BusinessCalendar::default();
        let span = cal.day_span(d(2025, 1, 10)).unwrap();
        assert_eq!(span.duration_ms(), 24 * 3_600_000);
    }

    #[test]
    fn offset_zone_shifts_instant() {
        let cal = BusinessCalendar::new(chrono_tz::America::Sao_Paulo);
        let t = cal.instant(d(2025, 1, 10), 9 * 60).unwrap();
        // UTC-3, no DST in 2025
        assert_eq!(t, BusinessCalendar::default().instant(d(2025, 1, 10), 12 * 60).unwrap());
        assert_eq!(cal.minute_of(t), Some(540));
    }

    #[test]
    fn spring_forward_gap_has_no_instant() {
        let cal = BusinessCalendar::new(chrono_tz::America::New_York);
        // 2025-03-09 02:30 does not exist in New York
        assert_eq!(cal.instant(d(2025, 3, 9), 150), None);
        assert!(cal.instant(d(2025, 3, 9), 180).is_some());
        let span = cal.day_span(d(2025, 3, 9)).unwrap();
        assert_eq!(span.duration_ms(), 23 * 3_600_000);
    }

    #[test]
    fn fall_back_picks_earliest() {
        let cal = BusinessCalendar::new(chrono_tz::America::New_York);
        // 2025-11-02 01:30 happens twice; earliest is EDT (UTC-4)
        let t = cal.instant(d(2025, 11, 2), 90).unwrap();
        let utc = BusinessCalendar::default();
        assert_eq!(t, utc.instant(d(2025, 11, 2), 5 * 60 + 30).unwrap());
    }

    #[test]
    fn weekday_numbering_starts_on_sunday() {
        assert_eq!(BusinessCalendar::weekday(d(2025, 1, 12)), 0); // Sunday
        assert_eq!(BusinessCalendar::weekday(d(2025, 1, 10)), 5); // Friday
    }
}
