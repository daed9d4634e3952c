//! Page-aware line diff over extracted document text.
//!
//! Pages are separated by form feeds (what `pdftotext` emits). Each page pair
//! is diffed line by line with an LCS; whitespace runs are collapsed before
//! comparison and blank lines are ignored. Within a run of changes, deleted
//! and inserted lines are paired off as modifications and the remainder are
//! reported as plain deletions or additions.
//!
//! Locations are approximations derived from the monospace layout text: one
//! line is `LINE_HEIGHT` points tall, one column is `CHAR_WIDTH` points wide.

use chrono::{DateTime, Utc};
use docdiff_core::{ComparisonResult, Difference, DifferenceKind, DifferenceLocation, PageDifferences};

const FORM_FEED: char = '\u{000C}';

const MARGIN: f64 = 36.0;
const CHAR_WIDTH: f64 = 6.0;
const LINE_HEIGHT: f64 = 12.0;

/// Above this many LCS cells a changed region is reported as a block replace.
const MAX_LCS_CELLS: usize = 4_000_000;

/// One step of an edit script, indexing into the two input slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEdit {
    Keep { left: usize, right: usize },
    Delete { left: usize },
    Insert { right: usize },
}

/// Split extracted text into pages. A trailing form feed does not start a page.
pub fn split_pages(text: &str) -> Vec<&str> {
    let mut pages: Vec<&str> = text.split(FORM_FEED).collect();
    if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    pages
}

/// Minimal edit script turning `left` into `right`.
pub fn diff_lines<T: PartialEq>(left: &[T], right: &[T]) -> Vec<LineEdit> {
    let prefix = left.iter().zip(right).take_while(|(a, b)| a == b).count();
    let suffix = left[prefix..]
        .iter()
        .rev()
        .zip(right[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let l = &left[prefix..left.len() - suffix];
    let r = &right[prefix..right.len() - suffix];

    let mut edits = Vec::with_capacity(left.len().max(right.len()));
    edits.extend((0..prefix).map(|i| LineEdit::Keep { left: i, right: i }));

    if (l.len() + 1).saturating_mul(r.len() + 1) > MAX_LCS_CELLS {
        edits.extend((0..l.len()).map(|i| LineEdit::Delete { left: prefix + i }));
        edits.extend((0..r.len()).map(|j| LineEdit::Insert { right: prefix + j }));
    } else {
        lcs_edits(l, r, prefix, &mut edits);
    }

    edits.extend((0..suffix).map(|k| LineEdit::Keep {
        left: left.len() - suffix + k,
        right: right.len() - suffix + k,
    }));
    edits
}

fn lcs_edits<T: PartialEq>(l: &[T], r: &[T], offset: usize, out: &mut Vec<LineEdit>) {
    let (n, m) = (l.len(), r.len());
    let width = m + 1;

    // table[i * width + j] = LCS length of l[i..] and r[j..]
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if l[i] == r[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if l[i] == r[j] {
            out.push(LineEdit::Keep {
                left: offset + i,
                right: offset + j,
            });
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            out.push(LineEdit::Delete { left: offset + i });
            i += 1;
        } else {
            out.push(LineEdit::Insert { right: offset + j });
            j += 1;
        }
    }
    out.extend((i..n).map(|i| LineEdit::Delete { left: offset + i }));
    out.extend((j..m).map(|j| LineEdit::Insert { right: offset + j }));
}

/// A non-blank line of a page.
struct Line<'a> {
    number: usize,
    raw: &'a str,
    key: String,
}

impl Line<'_> {
    fn location(&self) -> DifferenceLocation {
        let indent = self.raw.chars().take_while(|c| c.is_whitespace()).count();
        let len = self.raw.trim().chars().count();
        DifferenceLocation {
            x: MARGIN + indent as f64 * CHAR_WIDTH,
            y: MARGIN + self.number as f64 * LINE_HEIGHT,
            width: len as f64 * CHAR_WIDTH,
            height: LINE_HEIGHT,
        }
    }
}

fn content_lines(page: &str) -> Vec<Line<'_>> {
    page.lines()
        .enumerate()
        .filter_map(|(number, raw)| {
            let key = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            (!key.is_empty()).then_some(Line { number, raw, key })
        })
        .collect()
}

struct PageBuilder<'c> {
    page: PageDifferences,
    next_id: &'c mut usize,
}

impl PageBuilder<'_> {
    fn push(&mut self, kind: DifferenceKind, line: &Line<'_>) {
        let id = format!("diff_{}_{}", self.page.page_number, *self.next_id);
        *self.next_id += 1;
        self.page.push(Difference {
            id,
            kind,
            location: line.location(),
            content: Some(line.raw.trim().to_string()),
            confidence: 100,
        });
    }

    fn flush(&mut self, left: &[Line<'_>], right: &[Line<'_>], deleted: &mut Vec<usize>, inserted: &mut Vec<usize>) {
        let paired = deleted.len().min(inserted.len());
        for &j in &inserted[..paired] {
            self.push(DifferenceKind::Modification, &right[j]);
        }
        for &i in &deleted[paired..] {
            self.push(DifferenceKind::Deletion, &left[i]);
        }
        for &j in &inserted[paired..] {
            self.push(DifferenceKind::Addition, &right[j]);
        }
        deleted.clear();
        inserted.clear();
    }
}

fn diff_page(page_number: u32, left: &str, right: &str, next_id: &mut usize) -> PageDifferences {
    let left = content_lines(left);
    let right = content_lines(right);
    let left_keys: Vec<&str> = left.iter().map(|l| l.key.as_str()).collect();
    let right_keys: Vec<&str> = right.iter().map(|l| l.key.as_str()).collect();

    let mut builder = PageBuilder {
        page: PageDifferences::new(page_number),
        next_id,
    };
    let mut deleted = Vec::new();
    let mut inserted = Vec::new();

    for edit in diff_lines(&left_keys, &right_keys) {
        match edit {
            LineEdit::Keep { .. } => builder.flush(&left, &right, &mut deleted, &mut inserted),
            LineEdit::Delete { left: i } => deleted.push(i),
            LineEdit::Insert { right: j } => inserted.push(j),
        }
    }
    builder.flush(&left, &right, &mut deleted, &mut inserted);

    builder.page
}

/// Diff two extracted documents page by page.
///
/// A page missing on one side is compared against an empty page.
pub fn diff_documents(left: &str, right: &str, generated_at: DateTime<Utc>) -> ComparisonResult {
    let left_pages = split_pages(left);
    let right_pages = split_pages(right);
    let page_count = left_pages.len().max(right_pages.len());

    let mut next_id = 0;
    let mut pages = Vec::with_capacity(page_count);
    for index in 0..page_count {
        let l = left_pages.get(index).copied().unwrap_or("");
        let r = right_pages.get(index).copied().unwrap_or("");
        pages.push(diff_page(index as u32 + 1, l, r, &mut next_id));
    }

    ComparisonResult::from_pages(pages, generated_at)
}
