mod assignments;
mod availability;
mod cache;
mod error;
mod lifecycle;
mod store;
#[cfg(test)]
mod tests;

pub use availability::AgendaEntry;
pub use cache::BusyCache;
pub use error::EngineError;
pub use lifecycle::ConfirmOutcome;
pub use store::{ContextBook, Tables};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};

use crate::config::SchedulingSettings;
use crate::feed::BusyFeed;
use crate::model::*;
use crate::outbox::{DomainEvent, Outbox};
use crate::wal::{Frame, Wal};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        frame: Frame,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Frame, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches frames for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { frame, response } => {
                let mut batch = vec![(frame, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { frame, response }) => batch.push((frame, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, frames = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (frame, _) in batch {
        if let Err(e) = wal.append_buffered(frame) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so a half-buffered batch does not
    // bleed into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Staging area handed to a transaction closure.
///
/// Reads see committed state only; staged events become visible once the
/// whole transaction commits.
pub struct Tx<'a> {
    tables: &'a Tables,
    calendar: &'a crate::calendar::BusinessCalendar,
    events: Vec<Event>,
    outbox: Vec<DomainEvent>,
}

impl<'a> Tx<'a> {
    pub fn tables(&self) -> &'a Tables {
        self.tables
    }

    pub fn calendar(&self) -> &'a crate::calendar::BusinessCalendar {
        self.calendar
    }

    /// Stage a WAL event for this transaction's frame.
    pub fn stage(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Queue a domain event for publication after commit.
    pub fn publish(&mut self, event: DomainEvent) {
        self.outbox.push(event);
    }
}

/// One tenant's scheduling core: committed tables, WAL writer, busy cache,
/// outbox, and the external busy feed.
pub struct Engine {
    tables: RwLock<Tables>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub outbox: Arc<Outbox>,
    pub(super) feed: Arc<dyn BusyFeed>,
    pub(super) cache: BusyCache,
    pub(super) settings: SchedulingSettings,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        outbox: Arc<Outbox>,
        feed: Arc<dyn BusyFeed>,
        settings: SchedulingSettings,
    ) -> io::Result<Self> {
        let frames = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut tables = Tables::default();
        let mut replayed = 0usize;
        for event in frames.iter().flatten() {
            tables.apply(event, &settings.calendar);
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!(
                path = %wal_path.display(),
                frames = frames.len(),
                events = replayed,
                "replayed WAL"
            );
        }

        Ok(Self {
            tables: RwLock::new(tables),
            wal_tx,
            outbox,
            feed,
            cache: BusyCache::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &SchedulingSettings {
        &self.settings
    }

    /// Shared read access to committed state.
    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    /// Run `f` with exclusive access to the tables. On `Ok` the staged events
    /// are written as one WAL frame, applied, and the touched dates evicted
    /// from the busy cache before the lock is released; domain events are
    /// published afterwards. On `Err` nothing is written.
    pub async fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Tx<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut tables = self.tables.write().await;
        let mut tx = Tx {
            tables: &*tables,
            calendar: &self.settings.calendar,
            events: Vec::new(),
            outbox: Vec::new(),
        };
        let value = f(&mut tx)?;
        let Tx { events, outbox, .. } = tx;

        if !events.is_empty() {
            self.wal_append(events.clone()).await?;
            for event in &events {
                let dates = tables.apply(event, &self.settings.calendar);
                self.cache.invalidate_dates(&dates);
            }
        }
        drop(tables);

        for event in outbox {
            self.outbox.publish(event);
        }
        Ok(value)
    }

    /// Write a frame to the WAL via the background group-commit writer.
    async fn wal_append(&self, frame: Frame) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { frame, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Rewrite the WAL as a snapshot of the current state. Holds the write
    /// lock so no frame can land between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let tables = self.tables.write().await;
        let snapshot = tables.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(tables);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
