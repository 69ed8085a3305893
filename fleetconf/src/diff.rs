//! Line-level configuration diff.
//!
//! [`diff`] compares the running configuration with the rendered one using
//! Myers' shortest edit script (an LCS diff) from `similar`. It is pure and
//! deterministic: identical inputs always produce an identical [`ChangeSet`],
//! and a text compared with itself produces an empty one.

use std::fmt;

use serde::Serialize;
use similar::{Algorithm, ChangeTag, DiffTag};

/// Kind of a single line edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Unchanged,
    Added,
    Removed,
}

/// One line of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LineEdit {
    pub kind: EditKind,
    pub content: String,
}

impl LineEdit {
    fn prefix(&self) -> char {
        match self.kind {
            EditKind::Unchanged => ' ',
            EditKind::Added => '+',
            EditKind::Removed => '-',
        }
    }
}

/// Ordered line edits between two configurations.
///
/// Empty when the two configurations are equal; otherwise it holds every
/// line of both sides, with unchanged lines kept for context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ChangeSet {
    edits: Vec<LineEdit>,
}

/// Counts of each edit kind in a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} -{}", self.added, self.removed)
    }
}

/// Compute the change set that turns `old` into `new`.
pub fn diff(old: &str, new: &str) -> ChangeSet {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let ops = similar::capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines);
    if ops.iter().all(|op| op.tag() == DiffTag::Equal) {
        return ChangeSet::default();
    }

    let edits = ops
        .iter()
        .flat_map(|op| op.iter_changes(&old_lines, &new_lines))
        .map(|change| LineEdit {
            kind: match change.tag() {
                ChangeTag::Equal => EditKind::Unchanged,
                ChangeTag::Insert => EditKind::Added,
                ChangeTag::Delete => EditKind::Removed,
            },
            content: change.value().to_string(),
        })
        .collect();

    ChangeSet { edits }
}

impl ChangeSet {
    /// Whether the two sides were identical.
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// All edits in order.
    pub fn edits(&self) -> &[LineEdit] {
        &self.edits
    }

    /// Lines present only in the new configuration.
    pub fn added(&self) -> impl Iterator<Item = &str> {
        self.of_kind(EditKind::Added)
    }

    /// Lines present only in the old configuration.
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.of_kind(EditKind::Removed)
    }

    fn of_kind(&self, kind: EditKind) -> impl Iterator<Item = &str> {
        self.edits
            .iter()
            .filter(move |e| e.kind == kind)
            .map(|e| e.content.as_str())
    }

    /// Count edits by kind.
    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for edit in &self.edits {
            match edit.kind {
                EditKind::Unchanged => summary.unchanged += 1,
                EditKind::Added => summary.added += 1,
                EditKind::Removed => summary.removed += 1,
            }
        }
        summary
    }

    /// Render as unified-diff hunks with `context` unchanged lines around
    /// each change. Returns an empty string for an empty change set.
    pub fn unified(&self, context: usize) -> String {
        let mut out = String::new();
        if self.edits.is_empty() {
            return out;
        }

        // 1-based line numbers of each edit on the old and new side
        let mut old_no = Vec::with_capacity(self.edits.len());
        let mut new_no = Vec::with_capacity(self.edits.len());
        let (mut o, mut n) = (1usize, 1usize);
        for edit in &self.edits {
            old_no.push(o);
            new_no.push(n);
            match edit.kind {
                EditKind::Unchanged => {
                    o += 1;
                    n += 1;
                }
                EditKind::Removed => o += 1,
                EditKind::Added => n += 1,
            }
        }

        let last = self.edits.len() - 1;
        let mut hunks: Vec<(usize, usize)> = Vec::new();
        for (i, edit) in self.edits.iter().enumerate() {
            if edit.kind == EditKind::Unchanged {
                continue;
            }
            let start = i.saturating_sub(context);
            let end = (i + context).min(last);
            match hunks.last_mut() {
                Some((_, prev_end)) if start <= *prev_end + 1 => *prev_end = end,
                _ => hunks.push((start, end)),
            }
        }

        for (start, end) in hunks {
            let slice = &self.edits[start..=end];
            let old_len = slice.iter().filter(|e| e.kind != EditKind::Added).count();
            let new_len = slice.iter().filter(|e| e.kind != EditKind::Removed).count();
            let old_start = if old_len == 0 { old_no[start] - 1 } else { old_no[start] };
            let new_start = if new_len == 0 { new_no[start] - 1 } else { new_no[start] };

            out.push_str(&format!(
                "@@ -{old_start},{old_len} +{new_start},{new_len} @@\n"
            ));
            for edit in slice {
                out.push(edit.prefix());
                out.push_str(&edit.content);
                out.push('\n');
            }
        }
        out
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unified(3))
    }
}
