use crate::convert::CanonicalTable;
use serde::Serialize;

/// What a canonical table feeds: grade rows or a class roster. Decided
/// from the header so one upload endpoint serves both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportTarget {
    Notes,
    Eleves,
}

impl ImportTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportTarget::Notes => "notes",
            ImportTarget::Eleves => "eleves",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notes" => Some(ImportTarget::Notes),
            "eleves" => Some(ImportTarget::Eleves),
            _ => None,
        }
    }

    fn required_headers(self) -> &'static [&'static str] {
        match self {
            ImportTarget::Notes => &["matricule", "matiere", "evaluation", "note"],
            ImportTarget::Eleves => &["nom", "prenoms"],
        }
    }
}

pub fn detect_target(header: &[String]) -> ImportTarget {
    if header.iter().any(|h| h == "note") {
        ImportTarget::Notes
    } else {
        ImportTarget::Eleves
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub line_count: usize,
    pub errors: Vec<String>,
    pub valid: bool,
}

impl ValidationReport {
    fn from_errors(line_count: usize, errors: Vec<String>) -> Self {
        let valid = errors.is_empty();
        Self {
            line_count,
            errors,
            valid,
        }
    }
}

/// French grade sheets commonly carry comma decimals, OCR dumps even more
/// so.
pub fn parse_note(cell: &str) -> Option<f64> {
    cell.trim().replace(',', ".").parse::<f64>().ok()
}

/// Structural checks on a canonical table. Always returns a report; a
/// broken table is findings, not a failure. When the required headers are
/// missing the rows are not scanned and the count covers the header line
/// only.
pub fn validate_table(table: &CanonicalTable) -> (ImportTarget, ValidationReport) {
    let Some(header) = table.header() else {
        return (
            ImportTarget::Eleves,
            ValidationReport::from_errors(0, vec!["table vide".to_string()]),
        );
    };

    let target = detect_target(header);
    let missing: Vec<&str> = target
        .required_headers()
        .iter()
        .filter(|h| !header.iter().any(|cell| cell == *h))
        .copied()
        .collect();
    if !missing.is_empty() {
        return (
            target,
            ValidationReport::from_errors(
                1,
                vec![format!("en-têtes manquants: {}", missing.join(", "))],
            ),
        );
    }

    let note_idx = header.iter().position(|h| h == "note");
    let mut errors = Vec::new();

    for (i, row) in table.rows.iter().enumerate().skip(1) {
        let line = i + 1;
        if row.len() != header.len() {
            errors.push(format!("ligne {}: nombre de colonnes incorrect", line));
        }
        if let Some(idx) = note_idx {
            if let Some(cell) = row.get(idx) {
                if !cell.trim().is_empty() {
                    match parse_note(cell) {
                        Some(v) if (0.0..=20.0).contains(&v) => {}
                        _ => errors.push(format!("ligne {}: note invalide ({})", line, cell.trim())),
                    }
                }
            }
        }
    }

    (
        target,
        ValidationReport::from_errors(table.line_count(), errors),
    )
}
