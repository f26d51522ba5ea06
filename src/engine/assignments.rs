use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::COLLISIONS_TOTAL;
use crate::outbox::DomainEvent;

use super::{Engine, EngineError, Tables};

fn validate_new_assignment(data: &NewAssignment) -> Result<(), EngineError> {
    if data.start >= data.end || data.end > MINUTES_PER_DAY {
        return Err(EngineError::Validation(format!(
            "assignment window {}..{} must satisfy start < end <= {MINUTES_PER_DAY}",
            data.start, data.end
        )));
    }
    if data.capacity < 1 {
        return Err(EngineError::Validation("capacity must be at least 1".into()));
    }
    if data.staff_id == 0 {
        return Err(EngineError::Validation("staff_id is required".into()));
    }
    if data.service_area_id == 0 {
        return Err(EngineError::Validation("service_area_id is required".into()));
    }
    if data.service_keys.is_empty() {
        return Err(EngineError::Validation("at least one service key is required".into()));
    }
    if data.service_keys.len() > MAX_SERVICE_KEYS {
        return Err(EngineError::LimitExceeded("too many service keys"));
    }
    for key in &data.service_keys {
        if key.is_empty() {
            return Err(EngineError::Validation("service key must not be empty".into()));
        }
        if key.len() > MAX_SERVICE_KEY_LEN {
            return Err(EngineError::LimitExceeded("service key too long"));
        }
    }
    Ok(())
}

/// Staff and area collision check against active assignments of the same date.
/// Touching windows do not collide.
pub(super) fn check_collisions(tables: &Tables, date: NaiveDate, window: DayInterval, staff_id: u64, service_area_id: u64) -> Result<(), EngineError> {
    let active = tables
        .assignments_on(date)
        .into_iter()
        .filter(|a| a.is_active() && a.window.overlaps(&window));
    for existing in active {
        if existing.staff_id == staff_id {
            metrics::counter!(COLLISIONS_TOTAL, "kind" => "staff").increment(1);
            return Err(EngineError::StaffCollision { existing: existing.id });
        }
        if existing.service_area_id == service_area_id {
            metrics::counter!(COLLISIONS_TOTAL, "kind" => "area").increment(1);
            return Err(EngineError::AreaCollision { existing: existing.id });
        }
    }
    Ok(())
}

impl Engine {
    /// Collision-checked insert. Check and insert run under one transaction,
    /// so concurrent creations for the same staff or area cannot both land.
    pub async fn create_assignment(&self, data: NewAssignment) -> Result<Assignment, EngineError> {
        validate_new_assignment(&data)?;
        let window = DayInterval::new(data.start, data.end);

        let assignment = self
            .transaction(|tx| {
                let tables = tx.tables();
                if tables.assignment_count() >= MAX_ASSIGNMENTS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many assignments"));
                }
                if tables.assignment(&data.id).is_some() {
                    return Err(EngineError::Validation(format!("assignment {} already exists", data.id)));
                }
                check_collisions(tables, data.date, window, data.staff_id, data.service_area_id)?;

                let assignment = Assignment {
                    id: data.id,
                    date: data.date,
                    window,
                    staff_id: data.staff_id,
                    service_area_id: data.service_area_id,
                    service_keys: data.service_keys,
                    capacity: data.capacity,
                    status: AssignmentStatus::Active,
                };
                tx.stage(Event::AssignmentCreated { assignment: assignment.clone() });
                tx.publish(DomainEvent::AssignmentCreated { assignment: assignment.clone() });
                Ok(assignment)
            })
            .await?;

        info!(
            id = %assignment.id,
            date = %assignment.date,
            window = %assignment.window,
            staff_id = assignment.staff_id,
            service_area_id = assignment.service_area_id,
            "assignment created"
        );
        Ok(assignment)
    }

    /// Logical deletion. Disabling an already disabled assignment is a no-op.
    pub async fn disable_assignment(&self, id: Ulid) -> Result<(), EngineError> {
        let changed = self
            .transaction(|tx| {
                let assignment = tx.tables().assignment(&id).ok_or(EngineError::NotFound(id))?;
                if !assignment.is_active() {
                    return Ok(false);
                }
                tx.stage(Event::AssignmentDisabled { id });
                tx.publish(DomainEvent::AssignmentDisabled { id });
                Ok(true)
            })
            .await?;
        if changed {
            info!(%id, "assignment disabled");
        }
        Ok(())
    }

    pub async fn get_assignment(&self, id: &Ulid) -> Option<Assignment> {
        self.read().await.assignment(id).cloned()
    }

    /// Visible assignments of `date` ordered by start, optionally only those
    /// offering `service_key`.
    pub async fn list_assignments(&self, date: NaiveDate, service_key: Option<&str>) -> Vec<Assignment> {
        let tables = self.read().await;
        tables
            .assignments_on(date)
            .into_iter()
            .filter(|a| a.visible())
            .filter(|a| service_key.is_none_or(|key| a.offers(key)))
            .cloned()
            .collect()
    }
}
