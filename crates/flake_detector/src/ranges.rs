//! Line range sets.
//!
//! A `RangeSet` is a maximally compressed, ascending list of closed line
//! intervals. Diff hunks and trace spans are both reduced to this form so that
//! overlap can be answered with a single linear scan.

use std::fmt;

/// A closed interval of 1-based line numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// Create a range, swapping the bounds when given in descending order.
    pub fn new(a: u32, b: u32) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    /// A range covering exactly one line.
    pub fn single(line: u32) -> Self {
        Self {
            start: line,
            end: line,
        }
    }

    /// Inclusive overlap; a shared boundary line counts.
    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn touches_or_overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Sorted, non-adjacent, non-overlapping line ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<LineRange>,
}

impl RangeSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from individual line numbers in any order, duplicates allowed.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let mut lines: Vec<u32> = values.into_iter().collect();
        lines.sort_unstable();
        lines.dedup();

        let mut ranges: Vec<LineRange> = Vec::new();
        for line in lines {
            match ranges.last_mut() {
                Some(last) if last.end.checked_add(1) == Some(line) => last.end = line,
                _ => ranges.push(LineRange::single(line)),
            }
        }
        Self { ranges }
    }

    /// Build from sub-ranges in any order; overlapping and adjacent ranges merge.
    pub fn from_ranges<I>(input: I) -> Self
    where
        I: IntoIterator<Item = LineRange>,
    {
        let mut sorted: Vec<LineRange> = input.into_iter().collect();
        sorted.sort_unstable();

        let mut ranges: Vec<LineRange> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match ranges.last_mut() {
                Some(last) if last.touches_or_overlaps(&range) => {
                    last.end = last.end.max(range.end);
                }
                _ => ranges.push(range),
            }
        }
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineRange> {
        self.ranges.iter()
    }

    /// True when any line is shared between the two sets.
    ///
    /// Both sides are kept sorted by construction, so a two-pointer scan
    /// suffices. An empty set never overlaps anything.
    pub fn overlaps(&self, other: &RangeSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = &self.ranges[i];
            let b = &other.ranges[j];
            if a.overlaps(b) {
                return true;
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }
}

impl FromIterator<u32> for RangeSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self::from_values(iter)
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, range) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}
