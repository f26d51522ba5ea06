use tracing::info;
use ulid::Ulid;

use crate::busy::assignment_span;
use crate::calendar::BusinessCalendar;
use crate::limits::*;
use crate::model::*;
use crate::observability::{CASCADE_CANCELLATIONS_TOTAL, CONFLICTS_TOTAL};
use crate::outbox::{CancelCause, DomainEvent};
use crate::schedule::ScheduleSource;

use super::{now_ms, Engine, EngineError, Tables};

/// Result of a successful confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmOutcome {
    pub reservation: Reservation,
    /// Pending reservations of the same context cancelled by this confirmation.
    pub cancelled: Vec<Ulid>,
}

fn validate_request(start: Ms, duration_minutes: u32, client_ref: &str) -> Result<Span, EngineError> {
    if !ALLOWED_DURATIONS.contains(&duration_minutes) {
        return Err(EngineError::Validation(format!(
            "duration must be one of {ALLOWED_DURATIONS:?} minutes, got {duration_minutes}"
        )));
    }
    if client_ref.trim().is_empty() {
        return Err(EngineError::Validation("client_ref is required".into()));
    }
    if client_ref.len() > MAX_CLIENT_REF_LEN {
        return Err(EngineError::LimitExceeded("client_ref too long"));
    }
    let end = start.saturating_add(duration_minutes as Ms * MINUTE_MS);
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

/// The requested span must sit inside the context's bookable window.
fn check_bookable(tables: &Tables, calendar: &BusinessCalendar, context: Context, span: Span) -> Result<(), EngineError> {
    match context {
        Context::Assignment(aid) => {
            let assignment = tables.assignment(&aid).ok_or(EngineError::NotFound(aid))?;
            if !assignment.is_active() {
                return Err(EngineError::Validation(format!("assignment {aid} is disabled")));
            }
            let window = assignment_span(assignment, calendar)
                .ok_or_else(|| EngineError::Validation(format!("assignment {aid} window does not exist locally")))?;
            if !window.contains_span(&span) {
                return Err(EngineError::Validation(format!(
                    "reservation must fall inside assignment window {}",
                    assignment.window
                )));
            }
        }
        Context::Fixed => {
            let date = calendar
                .date_of(span.start)
                .ok_or_else(|| EngineError::Validation("start is not a valid instant".into()))?;
            let inside = tables.schedule().intervals_for(date).iter().any(|iv| {
                match (calendar.instant(date, iv.start), calendar.instant(date, iv.end)) {
                    (Some(s), Some(e)) => s <= span.start && span.end <= e,
                    _ => false,
                }
            });
            if !inside {
                return Err(EngineError::Validation(format!(
                    "reservation on {date} is outside the fixed schedule"
                )));
            }
        }
    }
    Ok(())
}

fn confirmed_overlap(tables: &Tables, context: &Context, span: Span, except: Ulid) -> Option<Ulid> {
    tables
        .overlapping(context, span)
        .into_iter()
        .find(|r| r.state == ReservationState::Confirmed && r.id != except)
        .map(|r| r.id)
}

fn count_conflict<T>(result: &Result<T, EngineError>) {
    if let Err(EngineError::Conflict(_)) = result {
        metrics::counter!(CONFLICTS_TOTAL).increment(1);
    }
}

impl Engine {
    /// Create a `pending` reservation. Overlapping pending requests are
    /// accepted; only time already confirmed in the same context is refused.
    pub async fn request_reservation(
        &self,
        id: Ulid,
        context: Context,
        start: Ms,
        duration_minutes: u32,
        client_ref: String,
    ) -> Result<Reservation, EngineError> {
        let span = validate_request(start, duration_minutes, &client_ref)?;

        let result = self
            .transaction(|tx| {
                let tables = tx.tables();
                if tables.reservation_count() >= MAX_RESERVATIONS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many reservations"));
                }
                if tables.reservation(&id).is_some() {
                    return Err(EngineError::Validation(format!("reservation {id} already exists")));
                }
                check_bookable(tables, tx.calendar(), context, span)?;
                if let Some(existing) = confirmed_overlap(tables, &context, span, id) {
                    return Err(EngineError::Conflict(existing));
                }

                let reservation = Reservation {
                    id,
                    context,
                    start,
                    duration_minutes,
                    client_ref,
                    state: ReservationState::Pending,
                    cancelled_by: None,
                };
                tx.stage(Event::ReservationRequested { reservation: reservation.clone() });
                tx.publish(DomainEvent::ReservationRequested { reservation: reservation.clone() });
                Ok(reservation)
            })
            .await;
        count_conflict(&result);

        let reservation = result?;
        info!(%id, %context, start, duration_minutes, "reservation requested");
        Ok(reservation)
    }

    /// Confirm a pending reservation and, in the same transaction, cancel
    /// every other pending reservation of its context that overlaps it.
    ///
    /// A reservation already cancelled by a competing confirmation fails with
    /// `Conflict` naming the winner; any other non-pending state is
    /// `InvalidState`.
    pub async fn confirm(&self, id: Ulid) -> Result<ConfirmOutcome, EngineError> {
        let result = self
            .transaction(|tx| {
                let tables = tx.tables();
                let r = tables.reservation(&id).ok_or(EngineError::NotFound(id))?;
                match (r.state, r.cancelled_by) {
                    (ReservationState::Pending, _) => {}
                    (ReservationState::Cancelled, Some(winner)) => return Err(EngineError::Conflict(winner)),
                    (state, _) => return Err(EngineError::InvalidState { id, state }),
                }
                let span = r.span();
                if let Some(existing) = confirmed_overlap(tables, &r.context, span, id) {
                    return Err(EngineError::Conflict(existing));
                }

                let mut confirmed = r.clone();
                confirmed.state = ReservationState::Confirmed;
                tx.stage(Event::ReservationTransitioned {
                    id,
                    state: ReservationState::Confirmed,
                    cancelled_by: None,
                });
                tx.publish(DomainEvent::ReservationConfirmed { reservation: confirmed.clone() });

                let losers: Vec<Reservation> = tables
                    .overlapping(&r.context, span)
                    .into_iter()
                    .filter(|other| other.id != id && other.state == ReservationState::Pending)
                    .cloned()
                    .collect();
                let mut cancelled = Vec::with_capacity(losers.len());
                for mut loser in losers {
                    loser.state = ReservationState::Cancelled;
                    loser.cancelled_by = Some(id);
                    tx.stage(Event::ReservationTransitioned {
                        id: loser.id,
                        state: ReservationState::Cancelled,
                        cancelled_by: Some(id),
                    });
                    cancelled.push(loser.id);
                    tx.publish(DomainEvent::ReservationCancelled {
                        reservation: loser,
                        cause: CancelCause::Cascade { confirmed: id },
                    });
                }

                Ok(ConfirmOutcome { reservation: confirmed, cancelled })
            })
            .await;
        count_conflict(&result);

        let outcome = result?;
        if !outcome.cancelled.is_empty() {
            metrics::counter!(CASCADE_CANCELLATIONS_TOTAL).increment(outcome.cancelled.len() as u64);
        }
        info!(
            %id,
            context = %outcome.reservation.context,
            cancelled = outcome.cancelled.len(),
            "reservation confirmed"
        );
        Ok(outcome)
    }

    /// Manual cancellation of a pending or confirmed reservation.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let reservation = self
            .transaction(|tx| {
                let r = tx.tables().reservation(&id).ok_or(EngineError::NotFound(id))?;
                if r.state.is_terminal() {
                    return Err(EngineError::InvalidState { id, state: r.state });
                }
                let mut cancelled = r.clone();
                cancelled.state = ReservationState::Cancelled;
                cancelled.cancelled_by = None;
                tx.stage(Event::ReservationTransitioned {
                    id,
                    state: ReservationState::Cancelled,
                    cancelled_by: None,
                });
                tx.publish(DomainEvent::ReservationCancelled {
                    reservation: cancelled.clone(),
                    cause: CancelCause::Manual,
                });
                Ok(cancelled)
            })
            .await?;
        info!(%id, "reservation cancelled");
        Ok(reservation)
    }

    pub async fn mark_attendance(&self, id: Ulid, attended: bool) -> Result<Reservation, EngineError> {
        self.mark_attendance_at(id, attended, now_ms()).await
    }

    /// `confirmed → attended | no_attended`, only once the appointment has ended.
    pub async fn mark_attendance_at(&self, id: Ulid, attended: bool, now: Ms) -> Result<Reservation, EngineError> {
        let reservation = self
            .transaction(|tx| {
                let r = tx.tables().reservation(&id).ok_or(EngineError::NotFound(id))?;
                if r.state != ReservationState::Confirmed {
                    return Err(EngineError::InvalidState { id, state: r.state });
                }
                if now < r.end() {
                    return Err(EngineError::Validation(format!(
                        "reservation {id} has not ended yet"
                    )));
                }
                let state = if attended {
                    ReservationState::Attended
                } else {
                    ReservationState::NoAttended
                };
                let mut marked = r.clone();
                marked.state = state;
                tx.stage(Event::ReservationTransitioned {
                    id,
                    state,
                    cancelled_by: None,
                });
                tx.publish(DomainEvent::AttendanceMarked { reservation: marked.clone() });
                Ok(marked)
            })
            .await?;
        info!(%id, state = %reservation.state, "attendance marked");
        Ok(reservation)
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.read().await.reservation(id).cloned()
    }
}
