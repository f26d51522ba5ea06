use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::outbox::DomainEvent;
use crate::tenant::Tenant;

/// Delivery boundary for committed domain events (email, calendar sync, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, tenant: &str, event: &DomainEvent) -> Result<(), String>;
}

/// Default notifier: one structured log line per event with a JSON payload.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, tenant: &str, event: &DomainEvent) -> Result<(), String> {
        let payload = serde_json::to_string(event).map_err(|e| e.to_string())?;
        info!(tenant, kind = event.kind(), %payload, "domain event");
        Ok(())
    }
}

/// Consume a tenant's outbox and hand every event to `notifier`. Delivery
/// failures are logged and never touch committed state. Returns when the
/// outbox is dropped.
pub async fn run_dispatcher(
    tenant: String,
    mut rx: broadcast::Receiver<DomainEvent>,
    notifier: Arc<dyn Notifier>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(e) = notifier.notify(&tenant, &event).await {
                    warn!(%tenant, kind = event.kind(), error = %e, "notification failed");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(%tenant, skipped, "dispatcher lagged; events skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Background task that compacts the WAL once enough frames have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => warn!(error = %e, "WAL compaction failed"),
        }
    }
}

/// Background task that drops a tenant's ended external busy blocks and the
/// busy cache entries of past dates.
pub async fn run_pruner(tenant: String, target: Arc<Tenant>) {
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    loop {
        interval.tick().await;
        let (blocks, cached) = target.prune_expired(now_ms());
        if blocks > 0 || cached > 0 {
            debug!(%tenant, blocks, cached, "pruned expired busy data");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbox;
    use std::sync::Mutex;
    use ulid::Ulid;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, tenant: &str, event: &DomainEvent) -> Result<(), String> {
            self.seen.lock().unwrap().push(format!("{tenant}:{}", event.kind()));
            if self.fail { Err("smtp down".into()) } else { Ok(()) }
        }
    }

    #[tokio::test]
    async fn dispatcher_delivers_in_order_and_stops_on_close() {
        let outbox = Outbox::new();
        let notifier = Arc::new(Recording::default());
        let task = tokio::spawn(run_dispatcher("acme".into(), outbox.subscribe(), notifier.clone()));

        let id = Ulid::new();
        outbox.publish(DomainEvent::AssignmentDisabled { id });
        outbox.publish(DomainEvent::AssignmentDisabled { id });
        drop(outbox);
        task.await.unwrap();

        let seen = notifier.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["acme:assignment_disabled", "acme:assignment_disabled"]);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_stop_dispatch() {
        let outbox = Outbox::new();
        let notifier = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let task = tokio::spawn(run_dispatcher("acme".into(), outbox.subscribe(), notifier.clone()));

        for _ in 0..3 {
            outbox.publish(DomainEvent::AssignmentDisabled { id: Ulid::new() });
        }
        drop(outbox);
        task.await.unwrap();
        assert_eq!(notifier.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn log_notifier_accepts_every_event() {
        let event = DomainEvent::AssignmentDisabled { id: Ulid::new() };
        assert!(LogNotifier.notify("acme", &event).await.is_ok());
    }
}
