//! Comparison result payload produced by the engine and stored on completed jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a single difference between the two documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    /// Present in the right document only.
    Addition,
    /// Present in the left document only.
    Deletion,
    /// Changed in place.
    Modification,
}

/// Position of a difference on its page, in points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DifferenceLocation {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Difference {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DifferenceKind,
    pub location: DifferenceLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// 0-100.
    pub confidence: u8,
}

/// All differences found on one page (1-based page number).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageDifferences {
    pub page_number: u32,
    pub additions: Vec<Difference>,
    pub deletions: Vec<Difference>,
    pub modifications: Vec<Difference>,
    pub total_on_page: usize,
}

impl PageDifferences {
    pub fn new(page_number: u32) -> Self {
        Self {
            page_number,
            ..Default::default()
        }
    }

    /// Append a difference to the bucket matching its kind.
    pub fn push(&mut self, difference: Difference) {
        match difference.kind {
            DifferenceKind::Addition => self.additions.push(difference),
            DifferenceKind::Deletion => self.deletions.push(difference),
            DifferenceKind::Modification => self.modifications.push(difference),
        }
        self.total_on_page += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.total_on_page == 0
    }
}

/// Structured output of one comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub total_differences: usize,
    pub pages_affected: usize,
    pub differences_by_page: BTreeMap<u32, PageDifferences>,
    pub generated_at: DateTime<Utc>,
}

impl ComparisonResult {
    /// Build a result from per-page findings.
    ///
    /// Pages without differences are dropped; totals are derived from what remains.
    pub fn from_pages(
        pages: impl IntoIterator<Item = PageDifferences>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let differences_by_page: BTreeMap<u32, PageDifferences> = pages
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(|p| (p.page_number, p))
            .collect();

        Self {
            total_differences: differences_by_page.values().map(|p| p.total_on_page).sum(),
            pages_affected: differences_by_page.len(),
            differences_by_page,
            generated_at,
        }
    }

    /// A result with no differences at all.
    pub fn identical(generated_at: DateTime<Utc>) -> Self {
        Self::from_pages(Vec::new(), generated_at)
    }

    pub fn is_identical(&self) -> bool {
        self.total_differences == 0
    }
}
