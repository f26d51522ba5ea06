use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::busy::touched_dates;
use crate::calendar::BusinessCalendar;
use crate::model::*;
use crate::schedule::{Schedule, ScheduleSource};

/// Reservations of one context, sorted by `start`.
#[derive(Debug, Default)]
pub struct ContextBook {
    reservations: Vec<Reservation>,
}

impl ContextBook {
    /// Insert maintaining sort order by start.
    fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.start <= reservation.start);
        self.reservations.insert(pos, reservation);
    }

    fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter()
    }

    /// Reservations whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.end() > query.start)
    }
}

/// Committed state of one tenant.
#[derive(Debug, Default)]
pub struct Tables {
    schedule: Schedule,
    assignments: HashMap<Ulid, Assignment>,
    assignments_by_date: HashMap<NaiveDate, Vec<Ulid>>,
    books: HashMap<Context, ContextBook>,
    /// Reverse lookup: reservation id → context.
    reservation_context: HashMap<Ulid, Context>,
}

impl Tables {
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn intervals_for(&self, date: NaiveDate) -> Vec<DayInterval> {
        self.schedule.intervals_for(date)
    }

    pub fn assignment(&self, id: &Ulid) -> Option<&Assignment> {
        self.assignments.get(id)
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// All assignments of a date, active or not, sorted by window start.
    pub fn assignments_on(&self, date: NaiveDate) -> Vec<&Assignment> {
        let mut out: Vec<&Assignment> = self
            .assignments_by_date
            .get(&date)
            .into_iter()
            .flatten()
            .filter_map(|id| self.assignments.get(id))
            .collect();
        out.sort_by_key(|a| (a.window.start, a.id));
        out
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        let context = self.reservation_context.get(id)?;
        self.books.get(context)?.get(id)
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_context.len()
    }

    pub fn book(&self, context: &Context) -> Option<&ContextBook> {
        self.books.get(context)
    }

    /// Reservations of `context` overlapping `span`.
    pub fn overlapping(&self, context: &Context, span: Span) -> Vec<&Reservation> {
        self.books
            .get(context)
            .map(|book| book.overlapping(span).collect())
            .unwrap_or_default()
    }

    /// Every reservation whose span overlaps `span`, across contexts.
    pub fn all_overlapping(&self, span: Span) -> Vec<&Reservation> {
        let mut out: Vec<&Reservation> = self
            .books
            .values()
            .flat_map(|book| book.overlapping(span))
            .collect();
        out.sort_by_key(|r| (r.start, r.id));
        out
    }

    /// Apply a committed event. Returns the local dates whose busy view changed.
    pub fn apply(&mut self, event: &Event, calendar: &BusinessCalendar) -> Vec<NaiveDate> {
        match event {
            Event::ScheduleDaySet { weekday, day } => {
                self.schedule.set_day(*weekday, day.clone());
                Vec::new()
            }
            Event::AssignmentCreated { assignment } => {
                self.assignments_by_date
                    .entry(assignment.date)
                    .or_default()
                    .push(assignment.id);
                self.assignments.insert(assignment.id, assignment.clone());
                vec![assignment.date]
            }
            Event::AssignmentDisabled { id } => match self.assignments.get_mut(id) {
                Some(a) => {
                    a.status = AssignmentStatus::Disabled;
                    vec![a.date]
                }
                None => Vec::new(),
            },
            Event::ReservationRequested { reservation } => {
                self.reservation_context
                    .insert(reservation.id, reservation.context);
                self.books
                    .entry(reservation.context)
                    .or_default()
                    .insert(reservation.clone());
                touched_dates(reservation, calendar)
            }
            Event::ReservationTransitioned {
                id,
                state,
                cancelled_by,
            } => {
                let Some(context) = self.reservation_context.get(id) else {
                    return Vec::new();
                };
                match self.books.get_mut(context).and_then(|b| b.get_mut(id)) {
                    Some(r) => {
                        r.state = *state;
                        r.cancelled_by = *cancelled_by;
                        touched_dates(r, calendar)
                    }
                    None => Vec::new(),
                }
            }
        }
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .schedule
            .days()
            .filter(|(_, day)| **day != DaySchedule::default())
            .map(|(weekday, day)| Event::ScheduleDaySet {
                weekday,
                day: day.clone(),
            })
            .collect();

        let mut assignments: Vec<&Assignment> = self.assignments.values().collect();
        assignments.sort_by_key(|a| a.id);
        events.extend(assignments.into_iter().map(|a| Event::AssignmentCreated {
            assignment: a.clone(),
        }));

        let mut reservations: Vec<&Reservation> =
            self.books.values().flat_map(|b| b.iter()).collect();
        reservations.sort_by_key(|r| r.id);
        events.extend(reservations.into_iter().map(|r| Event::ReservationRequested {
            reservation: r.clone(),
        }));
        events
    }
}
