//! Interval-set algebra over a totally-ordered time axis.
//!
//! Intervals are closed and overlap includes touching endpoints, so
//! `[0,1] + [1,2] = [0,2]`. Removing a non-intersecting interval is a no-op.
//! Iteration order follows insertion history; it is deterministic but not
//! sorted.

/// Merge two intervals if they overlap or touch.
fn merge<T: Ord + Copy>((a, b): (T, T), (ca, cb): (T, T)) -> Option<(T, T)> {
    if b < ca || cb < a {
        None
    } else {
        Some((a.min(ca), b.max(cb)))
    }
}

/// Subtract `cut` from one interval, pushing zero, one, or two remnants.
fn subtract_into<T: Ord + Copy>((a, b): (T, T), (ca, cb): (T, T), out: &mut Vec<(T, T)>) {
    if ca <= a && b <= cb {
        // fully covered
    } else if a <= ca && ca <= b && b <= cb {
        out.push((a, ca));
    } else if ca <= a && a <= cb && cb <= b {
        out.push((cb, b));
    } else if a <= ca && cb <= b {
        out.push((a, ca));
        out.push((cb, b));
    } else {
        out.push((a, b));
    }
}

/// An ordered set of disjoint closed intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline<T> {
    intervals: Vec<(T, T)>,
}

impl<T: Ord + Copy> Timeline<T> {
    pub fn new() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }

    pub fn from_intervals(intervals: impl IntoIterator<Item = (T, T)>) -> Self {
        let mut tl = Self::new();
        for (a, b) in intervals {
            tl.add(a, b);
        }
        tl
    }

    /// Insert `[a,b]`, merging with overlapping intervals until idempotent.
    pub fn add(&mut self, a: T, b: T) {
        debug_assert!(a <= b);

        let mut candidate = (a, b);
        loop {
            let hit = self
                .intervals
                .iter()
                .enumerate()
                .find_map(|(idx, iv)| merge(candidate, *iv).map(|merged| (idx, merged)));

            match hit {
                Some((idx, merged)) => {
                    self.intervals.remove(idx);
                    candidate = merged;
                }
                None => {
                    self.intervals.push(candidate);
                    break;
                }
            }
        }
    }

    /// Subtract `[a,b]`; an interval may split into zero, one, or two
    /// remnants. Non-intersecting intervals are left untouched.
    pub fn remove(&mut self, a: T, b: T) {
        debug_assert!(a <= b);

        let mut next = Vec::with_capacity(self.intervals.len() + 1);
        for iv in &self.intervals {
            subtract_into(*iv, (a, b), &mut next);
        }
        self.intervals = next;
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (a, b) in &other.intervals {
            out.add(*a, *b);
        }
        out
    }

    pub fn difference(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (a, b) in &other.intervals {
            out.remove(*a, *b);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[(T, T)] {
        &self.intervals
    }

    pub fn into_intervals(self) -> Vec<(T, T)> {
        self.intervals
    }
}

/// Coalesce intervals whose gap is at most `offset`, clustering bursts into
/// islands. Returns islands in descending start order.
pub fn margin<T, D>(offset: D, intervals: &[(T, T)]) -> Vec<(T, T)>
where
    T: Ord + Copy + std::ops::Sub<Output = D>,
    D: PartialOrd + Copy,
{
    let mut sorted = intervals.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut islands: Vec<(T, T)> = Vec::new();
    for (a, b) in sorted {
        let joins_last = islands
            .last()
            .is_some_and(|(_, end)| a <= *end || a - *end <= offset);

        if joins_last {
            if let Some((_, end)) = islands.last_mut() {
                if b > *end {
                    *end = b;
                }
            }
        } else {
            islands.push((a, b));
        }
    }

    islands.reverse();
    islands
}
