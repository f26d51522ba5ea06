use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::busy::{assignment_busy, assignment_span, external_busy, fixed_busy, whole_day_busy};
use crate::feed::{FeedError, FeedPolicy};
use crate::model::*;
use crate::observability::FEED_FAILURES_TOTAL;
use crate::overlap::{placements, Placement};
use crate::schedule::normalize_day;
use crate::slots::{self, SlotParams};

use super::{now_ms, Engine, EngineError, Tables};

/// One reservation of a day's agenda with its overlap placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgendaEntry {
    pub reservation: Reservation,
    pub placement: Placement,
}

fn validate_duration(duration_minutes: u32) -> Result<(), EngineError> {
    if ALLOWED_DURATIONS.contains(&duration_minutes) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "duration must be one of {ALLOWED_DURATIONS:?} minutes, got {duration_minutes}"
        )))
    }
}

impl Engine {
    /// Replace one weekday of the fixed weekly template.
    pub async fn set_schedule_day(
        &self,
        weekday: u8,
        enabled: bool,
        intervals: Vec<DayInterval>,
    ) -> Result<DaySchedule, EngineError> {
        let day = normalize_day(weekday, enabled, intervals).map_err(EngineError::Validation)?;
        self.transaction(|tx| {
            tx.stage(Event::ScheduleDaySet {
                weekday,
                day: day.clone(),
            });
            Ok(())
        })
        .await?;
        info!(
            weekday,
            enabled = day.enabled,
            intervals = day.intervals.len(),
            "schedule day set"
        );
        Ok(day)
    }

    pub async fn schedule_day(&self, weekday: u8) -> Option<DaySchedule> {
        use crate::schedule::ScheduleSource;
        self.read().await.schedule().day(weekday).cloned()
    }

    /// Store-derived busy ranges, served from the cache when possible.
    /// Must be called with the tables read lock held so a concurrent commit
    /// cannot invalidate before the insert.
    fn internal_busy(&self, tables: &Tables, date: NaiveDate, context: Context) -> Result<Arc<Vec<BusyRange>>, EngineError> {
        if let Some(hit) = self.cache.get(date, context) {
            return Ok(hit);
        }
        let calendar = &self.settings.calendar;
        let ranges = match context {
            Context::Fixed => match calendar.day_span(date) {
                Some(day) => fixed_busy(tables.overlapping(&Context::Fixed, day), day),
                None => Vec::new(),
            },
            Context::Assignment(aid) => {
                let assignment = tables.assignment(&aid).ok_or(EngineError::NotFound(aid))?;
                match assignment_span(assignment, calendar) {
                    Some(window) if assignment.date == date => {
                        assignment_busy(tables.overlapping(&context, window), assignment, calendar)
                    }
                    _ => Vec::new(),
                }
            }
        };
        tracing::debug!(%date, %context, ranges = ranges.len(), "busy cache filled");
        Ok(self.cache.insert(date, context, ranges))
    }

    /// External busy ranges for the local day, with the configured timeout
    /// and failure policy applied.
    async fn external_busy_for(&self, date: NaiveDate) -> Result<Vec<BusyRange>, EngineError> {
        let Some(day) = self.settings.calendar.day_span(date) else {
            return Ok(Vec::new());
        };
        let timeout_ms = self.settings.feed_timeout_ms;
        let fetched = match tokio::time::timeout(Duration::from_millis(timeout_ms), self.feed.busy_blocks(day)).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(timeout_ms)),
        };
        match fetched {
            Ok(blocks) => Ok(external_busy(blocks)),
            Err(e) => {
                let policy = self.settings.feed_policy;
                let label = match policy {
                    FeedPolicy::FailClosed => "fail_closed",
                    FeedPolicy::FailOpen => "fail_open",
                    FeedPolicy::Surface => "surface",
                };
                metrics::counter!(FEED_FAILURES_TOTAL, "policy" => label).increment(1);
                warn!(%date, error = %e, policy = label, "external busy feed failed");
                match policy {
                    FeedPolicy::FailClosed => Ok(vec![whole_day_busy(day)]),
                    FeedPolicy::FailOpen => Ok(Vec::new()),
                    FeedPolicy::Surface => Err(EngineError::UpstreamUnavailable(e.to_string())),
                }
            }
        }
    }

    /// Drop cached busy ranges for local dates before the one `now` falls on.
    pub fn evict_past_busy(&self, now: Ms) -> usize {
        let Some(today) = self.settings.calendar.date_of(now) else {
            return 0;
        };
        let evicted = self.cache.evict_before(today);
        if evicted > 0 {
            tracing::debug!(%today, evicted, "past busy cache entries evicted");
        }
        evicted
    }

    /// Busy ranges for `date` in `context`, sorted by start.
    ///
    /// Fixed: confirmed fixed reservations plus the external feed.
    /// Assignment: confirmed reservations of that assignment inside its
    /// window only; the external feed does not apply.
    pub async fn busy_ranges(&self, date: NaiveDate, context: Context) -> Result<Vec<BusyRange>, EngineError> {
        let internal = {
            let tables = self.read().await;
            self.internal_busy(&tables, date, context)?
        };
        let mut ranges = internal.as_ref().clone();
        if context == Context::Fixed {
            ranges.extend(self.external_busy_for(date).await?);
        }
        ranges.sort_by_key(|b| (b.span.start, b.span.end));
        Ok(ranges)
    }

    pub async fn get_available_slots(
        &self,
        date: NaiveDate,
        duration_minutes: u32,
        context: Context,
    ) -> Result<Vec<Slot>, EngineError> {
        self.get_available_slots_at(date, duration_minutes, context, now_ms())
            .await
    }

    /// Bookable start times on `date` for `context`, evaluated at `now`.
    pub async fn get_available_slots_at(
        &self,
        date: NaiveDate,
        duration_minutes: u32,
        context: Context,
        now: Ms,
    ) -> Result<Vec<Slot>, EngineError> {
        validate_duration(duration_minutes)?;

        let (intervals, internal) = {
            let tables = self.read().await;
            let intervals = match context {
                Context::Fixed => tables.intervals_for(date),
                Context::Assignment(aid) => {
                    let assignment = tables.assignment(&aid).ok_or(EngineError::NotFound(aid))?;
                    if assignment.is_active() && assignment.date == date {
                        vec![assignment.window]
                    } else {
                        Vec::new()
                    }
                }
            };
            if intervals.is_empty() {
                return Ok(Vec::new());
            }
            (intervals, self.internal_busy(&tables, date, context)?)
        };

        let mut busy = internal.as_ref().clone();
        if context == Context::Fixed {
            busy.extend(self.external_busy_for(date).await?);
        }

        let params = SlotParams {
            grid: self.settings.grid_minutes,
            duration: duration_minutes,
            lead_time: self.settings.lead_time_minutes,
            now,
        };
        Ok(slots::generate(&intervals, &busy, date, &params, &self.settings.calendar))
    }

    /// Non-cancelled reservations touching `date`, ordered by start, each with
    /// its overlap cluster placement. `None` covers every context.
    pub async fn agenda(&self, date: NaiveDate, context: Option<Context>) -> Vec<AgendaEntry> {
        let Some(day) = self.settings.calendar.day_span(date) else {
            return Vec::new();
        };
        let reservations: Vec<Reservation> = {
            let tables = self.read().await;
            let found = match &context {
                Some(ctx) => tables.overlapping(ctx, day),
                None => tables.all_overlapping(day),
            };
            let mut found: Vec<Reservation> = found
                .into_iter()
                .filter(|r| r.state != ReservationState::Cancelled)
                .cloned()
                .collect();
            found.sort_by_key(|r| (r.start, r.id));
            found
        };

        let placed = placements(&reservations);
        reservations
            .into_iter()
            .zip(placed)
            .map(|(reservation, placement)| AgendaEntry {
                reservation,
                placement,
            })
            .collect()
    }
}
