use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only absolute time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Minutes in a local business day.
pub const MINUTES_PER_DAY: u32 = 1440;

/// Appointment lengths a reservation may request.
pub const ALLOWED_DURATIONS: [u32; 3] = [30, 60, 90];

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// A span ending exactly where another begins does not overlap it.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Minute-of-day interval `[start, end)` in the business timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayInterval {
    pub start: u32,
    pub end: u32,
}

impl DayInterval {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start < end && end <= MINUTES_PER_DAY);
        Self { start, end }
    }

    pub fn overlaps(&self, other: &DayInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, start: u32, end: u32) -> bool {
        self.start <= start && end <= self.end
    }
}

impl fmt::Display for DayInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hhmm(self.start), hhmm(self.end))
    }
}

/// Format a minute-of-day as `HH:MM`.
pub fn hhmm(minute: u32) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// One weekday of the fixed weekly template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub enabled: bool,
    /// Sorted by start, pairwise non-overlapping.
    pub intervals: Vec<DayInterval>,
}

/// Which availability source a query or reservation is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Context {
    Fixed,
    Assignment(Ulid),
}

impl Context {
    pub fn assignment_id(&self) -> Option<Ulid> {
        match self {
            Context::Fixed => None,
            Context::Assignment(id) => Some(*id),
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Fixed => write!(f, "fixed"),
            Context::Assignment(id) => write!(f, "assignment:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentStatus {
    Active,
    /// Logically deleted. Kept so existing reservations still resolve.
    Disabled,
}

/// A dated time block binding one staff member and one service area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Ulid,
    pub date: NaiveDate,
    pub window: DayInterval,
    pub staff_id: u64,
    pub service_area_id: u64,
    pub service_keys: Vec<String>,
    pub capacity: u32,
    pub status: AssignmentStatus,
}

impl Assignment {
    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }

    /// Listing projection: only active assignments are shown.
    pub fn visible(&self) -> bool {
        self.is_active()
    }

    pub fn offers(&self, service_key: &str) -> bool {
        self.service_keys.iter().any(|k| k == service_key)
    }
}

/// Input to `Engine::create_assignment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssignment {
    pub id: Ulid,
    pub date: NaiveDate,
    pub start: u32,
    pub end: u32,
    pub staff_id: u64,
    pub service_area_id: u64,
    pub service_keys: Vec<String>,
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    Pending,
    Confirmed,
    Cancelled,
    Attended,
    NoAttended,
}

impl ReservationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationState::Cancelled | ReservationState::Attended | ReservationState::NoAttended
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Pending => "pending",
            ReservationState::Confirmed => "confirmed",
            ReservationState::Cancelled => "cancelled",
            ReservationState::Attended => "attended",
            ReservationState::NoAttended => "no_attended",
        }
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub context: Context,
    pub start: Ms,
    pub duration_minutes: u32,
    pub client_ref: String,
    pub state: ReservationState,
    /// Set when a competing reservation's confirmation cancelled this one.
    pub cancelled_by: Option<Ulid>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.start + self.duration_minutes as Ms * MINUTE_MS)
    }

    pub fn end(&self) -> Ms {
        self.span().end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusySource {
    Fixed,
    Assignment,
    External,
}

impl BusySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusySource::Fixed => "fixed",
            BusySource::Assignment => "assignment",
            BusySource::External => "external",
        }
    }
}

/// Derived busy interval. Never persisted, recomputed per query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyRange {
    pub span: Span,
    pub source: BusySource,
    pub scope_id: Option<Ulid>,
    pub label: Option<String>,
}

/// A bookable start time, quantized to the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    /// Local minute-of-day of `start`.
    pub minute: u32,
}

/// WAL record body. A committed transaction is written as one frame holding
/// all of its events, so replay applies it entirely or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScheduleDaySet {
        weekday: u8,
        day: DaySchedule,
    },
    AssignmentCreated {
        assignment: Assignment,
    },
    AssignmentDisabled {
        id: Ulid,
    },
    ReservationRequested {
        reservation: Reservation,
    },
    ReservationTransitioned {
        id: Ulid,
        state: ReservationState,
        cancelled_by: Option<Ulid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_overlap_is_symmetric() {
        let a = Span::new(0, 30);
        let b = Span::new(20, 60);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn span_touching_does_not_overlap() {
        let a = Span::new(0, 30);
        let b = Span::new(30, 60);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
        assert!(Span::new(0, 31).overlaps(&b));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(0, 100);
        assert!(outer.contains_span(&Span::new(0, 100)));
        assert!(outer.contains_span(&Span::new(10, 20)));
        assert!(!outer.contains_span(&Span::new(90, 101)));
    }

    #[test]
    fn day_interval_display() {
        assert_eq!(DayInterval::new(540, 750).to_string(), "09:00-12:30");
        assert_eq!(hhmm(0), "00:00");
        assert_eq!(hhmm(1439), "23:59");
    }

    #[test]
    fn reservation_span_uses_duration() {
        let r = Reservation {
            id: Ulid::new(),
            context: Context::Fixed,
            start: 1_000_000,
            duration_minutes: 90,
            client_ref: "c".into(),
            state: ReservationState::Pending,
            cancelled_by: None,
        };
        assert_eq!(r.span(), Span::new(1_000_000, 1_000_000 + 90 * MINUTE_MS));
    }

    #[test]
    fn terminal_states() {
        assert!(!ReservationState::Pending.is_terminal());
        assert!(!ReservationState::Confirmed.is_terminal());
        assert!(ReservationState::Cancelled.is_terminal());
        assert!(ReservationState::Attended.is_terminal());
        assert!(ReservationState::NoAttended.is_terminal());
    }

    #[test]
    fn context_display() {
        let id = Ulid::new();
        assert_eq!(Context::Fixed.to_string(), "fixed");
        assert_eq!(Context::Assignment(id).to_string(), format!("assignment:{id}"));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AssignmentCreated {
            assignment: Assignment {
                id: Ulid::new(),
                date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
                window: DayInterval::new(540, 660),
                staff_id: 1,
                service_area_id: 2,
                service_keys: vec!["cut".into()],
                capacity: 1,
                status: AssignmentStatus::Active,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
