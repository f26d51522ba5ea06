use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::background::{self, LogNotifier, Notifier};
use crate::config::SchedulingSettings;
use crate::engine::{now_ms, Engine, EngineError};
use crate::feed::{ExternalBlock, FeedError, PushedBusyFeed};
use crate::limits::*;
use crate::model::{Ms, Span};
use crate::outbox::Outbox;

/// One tenant's engine plus the push-fed external busy feed behind it.
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub feed: Arc<PushedBusyFeed>,
}

impl Tenant {
    /// Record an external busy block reported by the calendar sync. A full
    /// feed first drops blocks that have already ended.
    pub fn push_external_busy(&self, start: Ms, end: Ms, label: Option<String>) -> Result<(), EngineError> {
        if start >= end {
            return Err(EngineError::Validation(format!("busy block {start}..{end} is empty or reversed")));
        }
        if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if label.as_ref().is_some_and(|l| l.len() > MAX_LABEL_LEN) {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        let block = ExternalBlock {
            span: Span::new(start, end),
            label,
        };
        match self.feed.push(block.clone()) {
            Err(FeedError::Full(_)) if self.feed.prune_before(now_ms()) > 0 => {
                self.feed.push(block).map_err(feed_error)
            }
            result => result.map_err(feed_error),
        }
    }

    /// Withdraw external busy blocks whose upstream event was deleted.
    pub fn remove_external_busy(&self, start: Ms, end: Ms) -> Result<usize, EngineError> {
        self.feed.remove(Span::new(start, end)).map_err(feed_error)
    }

    /// Drop external blocks and cached busy ranges that lie in the past.
    pub fn prune_expired(&self, now: Ms) -> (usize, usize) {
        (self.feed.prune_before(now), self.engine.evict_past_busy(now))
    }
}

fn feed_error(e: FeedError) -> EngineError {
    match e {
        FeedError::Full(_) => EngineError::LimitExceeded("too many external blocks"),
        other => EngineError::UpstreamUnavailable(other.to_string()),
    }
}

/// A tenant name must map one-to-one onto its WAL file name.
fn validate_tenant_name(tenant: &str) -> std::io::Result<()> {
    if tenant.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    if !tenant.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("tenant name {tenant:?} may only contain ASCII letters, digits, '_' and '-'"),
        ));
    }
    Ok(())
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// outbox dispatcher + compactor. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    settings: SchedulingSettings,
    notifier: Arc<dyn Notifier>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, settings: SchedulingSettings) -> Self {
        Self::with_notifier(data_dir, compact_threshold, settings, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        data_dir: PathBuf,
        compact_threshold: u64,
        settings: SchedulingSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
            settings,
            notifier,
        }
    }

    /// Get or lazily create the tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Tenant>> {
        if let Some(existing) = self.tenants.get(tenant) {
            return Ok(existing.value().clone());
        }
        validate_tenant_name(tenant)?;
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to create the same tenant; the entry lock
        // makes the second one reuse the first engine.
        let entry = self.tenants.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{tenant}.wal"));
        let outbox = Arc::new(Outbox::new());
        let feed = Arc::new(PushedBusyFeed::new());
        let engine = Arc::new(Engine::new(wal_path, outbox.clone(), feed.clone(), self.settings)?);

        tokio::spawn(background::run_dispatcher(
            tenant.to_string(),
            outbox.subscribe(),
            self.notifier.clone(),
        ));
        tokio::spawn(background::run_compactor(engine.clone(), self.compact_threshold));

        let created = Arc::new(Tenant { engine, feed });
        tokio::spawn(background::run_pruner(tenant.to_string(), created.clone()));
        entry.or_insert(created.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        tracing::info!(tenant, "tenant loaded");
        Ok(created)
    }
}
