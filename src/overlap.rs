//! Half-open overlap predicate and connected-component clustering.

use crate::model::{Assignment, BusyRange, DayInterval, Ms, Reservation, Span};

/// Anything occupying a `[start, end)` range.
pub trait Timed {
    fn span(&self) -> Span;
}

impl Timed for Span {
    fn span(&self) -> Span {
        *self
    }
}

impl Timed for Reservation {
    fn span(&self) -> Span {
        Reservation::span(self)
    }
}

impl Timed for BusyRange {
    fn span(&self) -> Span {
        self.span
    }
}

/// Assignments are compared by their minute-of-day window; callers only ever
/// cluster assignments of a single date.
impl Timed for Assignment {
    fn span(&self) -> Span {
        day_interval_span(&self.window)
    }
}

pub fn day_interval_span(interval: &DayInterval) -> Span {
    Span::new(interval.start as Ms, interval.end as Ms)
}

pub fn overlaps<A: Timed + ?Sized, B: Timed + ?Sized>(a: &A, b: &B) -> bool {
    a.span().overlaps(&b.span())
}

/// Position of one item inside its overlap cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Which cluster the item belongs to; clusters are numbered by earliest start.
    pub cluster: usize,
    /// Rank within the cluster, ordered by start (ties by input order).
    pub index: usize,
    /// Size of the cluster.
    pub count: usize,
}

/// Partition `items` into maximal groups connected by pairwise overlap.
///
/// Returns clusters of indices into `items`; each cluster is sorted by start
/// and the clusters themselves are ordered by their first start. O(n²), meant
/// for per-day cardinalities.
pub fn cluster<T: Timed>(items: &[T]) -> Vec<Vec<usize>> {
    let spans: Vec<Span> = items.iter().map(Timed::span).collect();
    let mut visited = vec![false; spans.len()];
    let mut clusters = Vec::new();

    for seed in 0..spans.len() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        let mut members = vec![seed];
        let mut stack = vec![seed];
        while let Some(cur) = stack.pop() {
            for (other, seen) in visited.iter_mut().enumerate() {
                if !*seen && spans[cur].overlaps(&spans[other]) {
                    *seen = true;
                    members.push(other);
                    stack.push(other);
                }
            }
        }
        members.sort_by_key(|&i| (spans[i].start, i));
        clusters.push(members);
    }

    clusters.sort_by_key(|members| (spans[members[0]].start, members[0]));
    clusters
}

/// Per-item placement, aligned with `items`.
pub fn placements<T: Timed>(items: &[T]) -> Vec<Placement> {
    let mut out = vec![
        Placement {
            cluster: 0,
            index: 0,
            count: 0,
        };
        items.len()
    ];
    for (c, members) in cluster(items).iter().enumerate() {
        for (index, &i) in members.iter().enumerate() {
            out[i] = Placement {
                cluster: c,
                index,
                count: members.len(),
            };
        }
    }
    out
}
