//! Default conversion collaborators. Each one wraps an external program;
//! the core only ever sees the traits in `convert`.

use crate::convert::{Collaborators, OcrEngine, SpreadsheetReader, TextExtractor};
use anyhow::{anyhow, Context};
use std::path::Path;
use std::process::Command;

fn run_capture(program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {}", program))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// `pdftotext -layout <file> -` style page-layout extraction.
pub struct CommandTextExtractor {
    program: String,
}

impl CommandTextExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl TextExtractor for CommandTextExtractor {
    fn extract_text(&self, path: &Path) -> anyhow::Result<String> {
        run_capture(
            &self.program,
            &["-layout", &path.to_string_lossy(), "-"],
        )
    }
}

/// `tesseract <file> stdout -l fra` style OCR.
pub struct CommandOcr {
    program: String,
}

impl CommandOcr {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl OcrEngine for CommandOcr {
    fn recognize(&self, path: &Path) -> anyhow::Result<String> {
        run_capture(
            &self.program,
            &[&path.to_string_lossy(), "stdout", "-l", "fra"],
        )
    }
}

/// Vision fallback wired to an arbitrary command taking the image path and
/// printing recognized text.
pub struct CommandVision {
    program: String,
}

impl CommandVision {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl OcrEngine for CommandVision {
    fn recognize(&self, path: &Path) -> anyhow::Result<String> {
        run_capture(&self.program, &[&path.to_string_lossy()])
    }
}

/// Placeholder for a fallback that was never configured.
pub struct DisabledOcr;

impl OcrEngine for DisabledOcr {
    fn recognize(&self, _path: &Path) -> anyhow::Result<String> {
        Err(anyhow!("vision fallback not configured"))
    }
}

/// `xlsx2csv <file> -` style converter; output parsed as comma CSV.
pub struct CommandSpreadsheetReader {
    program: String,
}

impl CommandSpreadsheetReader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SpreadsheetReader for CommandSpreadsheetReader {
    fn read_rows(&self, path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
        let out = run_capture(&self.program, &[&path.to_string_lossy(), "-"])?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(out.as_bytes());
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(|c| c.to_string()).collect());
        }
        Ok(rows)
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

pub fn default_collaborators() -> Collaborators {
    let vision: Box<dyn OcrEngine> = match std::env::var("BULLETIND_VISION_CMD") {
        Ok(cmd) if !cmd.trim().is_empty() => Box::new(CommandVision::new(cmd)),
        _ => Box::new(DisabledOcr),
    };
    Collaborators {
        spreadsheet: Box::new(CommandSpreadsheetReader::new(env_or(
            "BULLETIND_XLSX2CSV",
            "xlsx2csv",
        ))),
        text: Box::new(CommandTextExtractor::new(env_or(
            "BULLETIND_PDFTOTEXT",
            "pdftotext",
        ))),
        ocr: Box::new(CommandOcr::new(env_or("BULLETIND_TESSERACT", "tesseract"))),
        vision,
    }
}
