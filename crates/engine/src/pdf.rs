//! PDF comparison via Poppler's `pdftotext`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use docdiff_core::ComparisonResult;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::engine::{ComparisonEngine, EngineError};
use crate::text_diff::diff_documents;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Readers tolerate junk before the header; so do we, up to this many bytes.
const HEADER_SCAN_BYTES: usize = 1024;

/// `pdftotext` exit codes that blame the document: 1 (could not open or parse
/// the PDF) and 3 (the PDF's permissions forbid extraction).
const DOCUMENT_EXIT_CODES: [i32; 2] = [1, 3];

/// Extract stdout on success, or classify the failure.
///
/// Only exit codes that blame the document are permanent. Signals (no exit
/// code) and every other code are treated as environmental.
fn handle_cmd_output(
    result: std::io::Result<std::process::Output>,
    tool_name: &str,
    path: &Path,
) -> Result<String, EngineError> {
    match result {
        Ok(output) if output.status.success() => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = format!("{} failed on {}: {}", tool_name, path.display(), stderr.trim());
            match output.status.code() {
                Some(code) if DOCUMENT_EXIT_CODES.contains(&code) => Err(EngineError::Unparseable(detail)),
                Some(code) => Err(EngineError::Internal(format!("{detail} (exit code {code})"))),
                None => Err(EngineError::Internal(format!("{detail} (terminated by {})", output.status))),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(EngineError::ToolNotFound(format!("{tool_name} (install poppler-utils)")))
        }
        Err(e) => Err(EngineError::Io(e)),
    }
}

/// Default engine: extract layout text from both PDFs and diff it page by page.
#[derive(Debug, Clone)]
pub struct PdfTextEngine {
    binary: PathBuf,
}

impl Default for PdfTextEngine {
    fn default() -> Self {
        Self::new("pdftotext")
    }
}

impl PdfTextEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    async fn check_header(path: &Path) -> Result<(), EngineError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut head = Vec::with_capacity(HEADER_SCAN_BYTES);
        (&mut file).take(HEADER_SCAN_BYTES as u64).read_to_end(&mut head).await?;

        if head.is_empty() {
            return Err(EngineError::malformed(path, "file is empty"));
        }
        if !head.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC) {
            return Err(EngineError::malformed(path, "missing %PDF- header"));
        }
        Ok(())
    }

    async fn extract_text(&self, path: &Path) -> Result<String, EngineError> {
        let output = Command::new(&self.binary)
            .arg("-layout")
            .arg("-enc")
            .arg("UTF-8")
            .arg(path)
            .arg("-")
            .kill_on_drop(true)
            .output()
            .await;

        handle_cmd_output(output, &self.binary.display().to_string(), path)
    }
}

#[async_trait]
impl ComparisonEngine for PdfTextEngine {
    async fn compare(&self, left: &Path, right: &Path) -> Result<ComparisonResult, EngineError> {
        Self::check_header(left).await?;
        Self::check_header(right).await?;

        let (left_text, right_text) = tokio::try_join!(self.extract_text(left), self.extract_text(right))?;
        tracing::debug!(
            left_chars = left_text.len(),
            right_chars = right_text.len(),
            "extracted document text"
        );

        tokio::task::spawn_blocking(move || diff_documents(&left_text, &right_text, Utc::now()))
            .await
            .map_err(|e| EngineError::Internal(format!("diff task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn non_pdf_input_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let good = write(&dir, "a.pdf", b"%PDF-1.7\n...");
        let bad = write(&dir, "b.pdf", b"PK\x03\x04 this is a zip");

        let err = PdfTextEngine::default().compare(&good, &bad).await.unwrap_err();
        assert!(err.is_permanent(), "{err}");
        assert!(err.to_string().contains("missing %PDF- header"));
    }

    #[tokio::test]
    async fn empty_input_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write(&dir, "empty.pdf", b"");
        let good = write(&dir, "a.pdf", b"%PDF-1.4");

        let err = PdfTextEngine::default().compare(&empty, &good).await.unwrap_err();
        assert!(matches!(err, EngineError::Malformed { .. }));
    }

    #[tokio::test]
    async fn missing_tool_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(&dir, "a.pdf", b"%PDF-1.4\n");
        let b = write(&dir, "b.pdf", b"%PDF-1.4\n");

        let engine = PdfTextEngine::new("/nonexistent/bin/pdftotext-docdiff");
        let err = engine.compare(&a, &b).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolNotFound(_)), "{err}");
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn missing_input_file_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(&dir, "a.pdf", b"%PDF-1.4\n");
        let missing = dir.path().join("gone.pdf");

        let err = PdfTextEngine::default().compare(&a, &missing).await.unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(!err.is_permanent());
    }

    #[cfg(unix)]
    #[test]
    fn killed_or_failing_tool_is_transient() {
        use std::os::unix::process::ExitStatusExt;

        for status in [
            // SIGKILL, e.g. from the OOM killer
            std::process::ExitStatus::from_raw(9),
            // exit 99: pdftotext's catch-all error
            std::process::ExitStatus::from_raw(99 << 8),
        ] {
            let output = std::process::Output {
                status,
                stdout: Vec::new(),
                stderr: Vec::new(),
            };
            let err = handle_cmd_output(Ok(output), "pdftotext", Path::new("x.pdf")).unwrap_err();
            assert!(matches!(err, EngineError::Internal(_)), "{err}");
            assert!(!err.is_permanent());
        }
    }

    #[cfg(unix)]
    #[test]
    fn unopenable_document_exit_is_permanent() {
        use std::os::unix::process::ExitStatusExt;

        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(1 << 8),
            stdout: Vec::new(),
            stderr: b"Syntax Error: Couldn't find trailer dictionary\n".to_vec(),
        };
        let err = handle_cmd_output(Ok(output), "pdftotext", Path::new("x.pdf")).unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("trailer dictionary"));
    }
}
