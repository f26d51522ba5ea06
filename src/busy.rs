//! Busy-range aggregation.
//!
//! Internal busy ranges come from confirmed reservations in the store;
//! external ones come from the busy feed. Busy time is scoped by context:
//! a reservation against one assignment never suppresses another
//! assignment's slots, even at the same wall-clock time.

use chrono::NaiveDate;

use crate::calendar::BusinessCalendar;
use crate::feed::ExternalBlock;
use crate::model::{Assignment, BusyRange, BusySource, Context, Reservation, ReservationState, Span};

/// Confirmed fixed-schedule reservations overlapping the local day.
pub fn fixed_busy<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    day: Span,
) -> Vec<BusyRange> {
    confirmed_in(reservations, Context::Fixed, day, BusySource::Fixed)
}

/// Confirmed reservations of one assignment that fall inside its own window.
pub fn assignment_busy<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    assignment: &Assignment,
    calendar: &BusinessCalendar,
) -> Vec<BusyRange> {
    let Some(window) = assignment_span(assignment, calendar) else {
        return Vec::new();
    };
    confirmed_in(
        reservations,
        Context::Assignment(assignment.id),
        window,
        BusySource::Assignment,
    )
}

/// Absolute window of an assignment on its date.
pub fn assignment_span(assignment: &Assignment, calendar: &BusinessCalendar) -> Option<Span> {
    let start = calendar.instant(assignment.date, assignment.window.start)?;
    let end = calendar.instant(assignment.date, assignment.window.end)?;
    (start < end).then(|| Span::new(start, end))
}

pub fn external_busy(blocks: Vec<ExternalBlock>) -> Vec<BusyRange> {
    blocks
        .into_iter()
        .map(|b| BusyRange {
            span: b.span,
            source: BusySource::External,
            scope_id: None,
            label: b.label,
        })
        .collect()
}

/// One busy range covering the whole local day, used when the external feed
/// fails and the policy is to fail closed.
pub fn whole_day_busy(day: Span) -> BusyRange {
    BusyRange {
        span: day,
        source: BusySource::External,
        scope_id: None,
        label: Some("external feed unavailable".into()),
    }
}

/// Local dates a reservation's span touches; used for cache invalidation.
pub fn touched_dates(reservation: &Reservation, calendar: &BusinessCalendar) -> Vec<NaiveDate> {
    let span = reservation.span();
    let mut dates = Vec::with_capacity(2);
    if let Some(d) = calendar.date_of(span.start) {
        dates.push(d);
    }
    if let Some(d) = calendar.date_of(span.end - 1)
        && !dates.contains(&d)
    {
        dates.push(d);
    }
    dates
}

fn confirmed_in<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    context: Context,
    window: Span,
    source: BusySource,
) -> Vec<BusyRange> {
    let mut out: Vec<BusyRange> = reservations
        .into_iter()
        .filter(|r| r.state == ReservationState::Confirmed && r.context == context)
        .filter(|r| r.span().overlaps(&window))
        .map(|r| BusyRange {
            span: r.span(),
            source,
            scope_id: context.assignment_id(),
            label: Some(r.client_ref.clone()),
        })
        .collect();
    out.sort_by_key(|b| b.span.start);
    out
}
