use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::model::{BusyRange, Context};
use crate::observability::{BUSY_CACHE_HITS_TOTAL, BUSY_CACHE_MISSES_TOTAL};

/// Store-derived busy ranges per `(date, context)`.
///
/// Owned by one engine. Entries are evicted per date by every committed
/// transaction that touches that date; external feed data never enters.
#[derive(Default)]
pub struct BusyCache {
    entries: DashMap<(NaiveDate, Context), Arc<Vec<BusyRange>>>,
}

impl BusyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, date: NaiveDate, context: Context) -> Option<Arc<Vec<BusyRange>>> {
        match self.entries.get(&(date, context)) {
            Some(entry) => {
                metrics::counter!(BUSY_CACHE_HITS_TOTAL).increment(1);
                Some(entry.value().clone())
            }
            None => {
                metrics::counter!(BUSY_CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    pub fn insert(&self, date: NaiveDate, context: Context, ranges: Vec<BusyRange>) -> Arc<Vec<BusyRange>> {
        let ranges = Arc::new(ranges);
        self.entries.insert((date, context), ranges.clone());
        ranges
    }

    /// Evict every context cached for the given dates.
    pub fn invalidate_dates(&self, dates: &[NaiveDate]) {
        if dates.is_empty() {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|(date, _), _| !dates.contains(date));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            tracing::debug!(?dates, evicted, "busy cache invalidated");
        }
    }

    /// Evict every entry for a date before `cutoff`. Past days are never
    /// queried for slots again, so nothing else would remove them.
    pub fn evict_before(&self, cutoff: NaiveDate) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(date, _), _| *date >= cutoff);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
