use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Assignment, Reservation};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    Manual,
    /// Another reservation for the same time was confirmed.
    Cascade { confirmed: Ulid },
}

/// Facts published after a transaction commits. Delivery (email, calendar
/// sync) happens outside the core and never affects what was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    AssignmentCreated { assignment: Assignment },
    AssignmentDisabled { id: Ulid },
    ReservationRequested { reservation: Reservation },
    ReservationConfirmed { reservation: Reservation },
    ReservationCancelled { reservation: Reservation, cause: CancelCause },
    AttendanceMarked { reservation: Reservation },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::AssignmentCreated { .. } => "assignment_created",
            DomainEvent::AssignmentDisabled { .. } => "assignment_disabled",
            DomainEvent::ReservationRequested { .. } => "reservation_requested",
            DomainEvent::ReservationConfirmed { .. } => "reservation_confirmed",
            DomainEvent::ReservationCancelled { .. } => "reservation_cancelled",
            DomainEvent::AttendanceMarked { .. } => "attendance_marked",
        }
    }
}

/// Broadcast outbox of committed domain events for one tenant.
pub struct Outbox {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }
}
