//! External-calendar busy feed boundary.

use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::limits::MAX_EXTERNAL_BLOCKS;
use crate::model::{Ms, Span};

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("busy feed unreachable: {0}")]
    Unavailable(String),
    #[error("busy feed timed out after {0}ms")]
    Timeout(u64),
    #[error("busy feed holds the maximum of {0} blocks")]
    Full(usize),
}

/// An external busy block, already converted to absolute instants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBlock {
    pub span: Span,
    pub label: Option<String>,
}

/// Busy blocks from a third-party calendar overlapping `window` (one local day).
#[async_trait]
pub trait BusyFeed: Send + Sync {
    async fn busy_blocks(&self, window: Span) -> Result<Vec<ExternalBlock>, FeedError>;
}

/// What the slot query does when the feed fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedPolicy {
    /// The whole day is reported busy.
    #[default]
    FailClosed,
    /// External data is ignored for this query.
    FailOpen,
    /// The query fails with `UpstreamUnavailable`.
    Surface,
}

impl FromStr for FeedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail_closed" | "closed" => Ok(FeedPolicy::FailClosed),
            "fail_open" | "open" => Ok(FeedPolicy::FailOpen),
            "surface" => Ok(FeedPolicy::Surface),
            other => Err(format!("unknown feed policy {other:?}")),
        }
    }
}

/// Feed with no external calendar behind it.
#[derive(Debug, Default)]
pub struct NoExternalFeed;

#[async_trait]
impl BusyFeed for NoExternalFeed {
    async fn busy_blocks(&self, _window: Span) -> Result<Vec<ExternalBlock>, FeedError> {
        Ok(Vec::new())
    }
}

/// In-memory feed filled by an out-of-process calendar sync.
#[derive(Debug, Default)]
pub struct PushedBusyFeed {
    blocks: RwLock<Vec<ExternalBlock>>,
}

impl PushedBusyFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, block: ExternalBlock) -> Result<(), FeedError> {
        let mut blocks = self
            .blocks
            .write()
            .map_err(|_| FeedError::Unavailable("feed lock poisoned".into()))?;
        if blocks.len() >= MAX_EXTERNAL_BLOCKS {
            return Err(FeedError::Full(MAX_EXTERNAL_BLOCKS));
        }
        let pos = blocks.partition_point(|b| b.span.start <= block.span.start);
        blocks.insert(pos, block);
        Ok(())
    }

    /// Remove every block with exactly this span, e.g. after the upstream
    /// event was deleted. Returns how many were removed.
    pub fn remove(&self, span: Span) -> Result<usize, FeedError> {
        let mut blocks = self
            .blocks
            .write()
            .map_err(|_| FeedError::Unavailable("feed lock poisoned".into()))?;
        let before = blocks.len();
        blocks.retain(|b| b.span != span);
        Ok(before - blocks.len())
    }

    /// Drop blocks that ended at or before `cutoff`. Returns how many were dropped.
    pub fn prune_before(&self, cutoff: Ms) -> usize {
        match self.blocks.write() {
            Ok(mut blocks) => {
                let before = blocks.len();
                blocks.retain(|b| b.span.end > cutoff);
                before - blocks.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BusyFeed for PushedBusyFeed {
    async fn busy_blocks(&self, window: Span) -> Result<Vec<ExternalBlock>, FeedError> {
        let blocks = self
            .blocks
            .read()
            .map_err(|_| FeedError::Unavailable("feed lock poisoned".into()))?;
        let right = blocks.partition_point(|b| b.span.start < window.end);
        Ok(blocks[..right]
            .iter()
            .filter(|b| b.span.end > window.start)
            .cloned()
            .collect())
    }
}
