//! Unified-diff hunk header parsing.
//!
//! Only the new-file side of `@@ -a,b +c,d @@` is of interest: it says which
//! lines of the current source were touched.

use crate::ranges::LineRange;

/// The new-file side of a hunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkSpan {
    pub start: u32,
    pub count: u32,
}

impl HunkSpan {
    /// Lines of the new file covered by this hunk.
    ///
    /// A pure deletion (`count == 0`) has no new lines; it maps to the line
    /// adjacent to the removal so that code running across the deletion point
    /// still correlates with it.
    pub fn to_range(self) -> LineRange {
        if self.count == 0 {
            LineRange::single(self.start.max(1))
        } else {
            LineRange::new(self.start, self.start + (self.count - 1))
        }
    }
}

/// Parse the `+c,d` part of a hunk header.
///
/// `+c` without a count is the unified-diff shorthand for a single line.
/// Returns `None` when the header does not have that shape.
pub fn parse_header(header: &str) -> Option<HunkSpan> {
    let body = header.trim().strip_prefix("@@")?;
    let close = body.find("@@")?;
    let side = body[..close]
        .split_whitespace()
        .find(|token| token.starts_with('+'))?;
    let side = &side[1..];

    let (start, count) = match side.split_once(',') {
        Some((start, count)) => (start.parse::<u32>().ok()?, count.parse::<u32>().ok()?),
        None => (side.parse::<u32>().ok()?, 1),
    };
    if start == 0 && count > 0 {
        return None;
    }
    start.checked_add(count)?;
    Some(HunkSpan { start, count })
}
