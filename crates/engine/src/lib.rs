//! `docdiff-engine`
//!
//! **Responsibility:** the comparison engine boundary.
//!
//! The job pipeline treats the engine as opaque: two local files in, a
//! [`ComparisonResult`](docdiff_core::ComparisonResult) or an [`EngineError`] out.
//! This crate owns that contract, the error classification the executor relies
//! on, and the default `pdftotext`-backed implementation.

pub mod engine;
pub mod pdf;
pub mod text_diff;

pub use engine::{ComparisonEngine, EngineError};
pub use pdf::PdfTextEngine;
pub use text_diff::{LineEdit, diff_documents, diff_lines, split_pages};
