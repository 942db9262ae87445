use crate::error::CoreError;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Supported upload kinds. The string forms are the persisted
/// `type_fichier` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Spreadsheet,
    DelimitedText,
    Document,
    Image,
}

impl FileKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "excel" | "spreadsheet" => Some(FileKind::Spreadsheet),
            "csv" | "texte" => Some(FileKind::DelimitedText),
            "pdf" | "document" => Some(FileKind::Document),
            "image" => Some(FileKind::Image),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Spreadsheet => "excel",
            FileKind::DelimitedText => "csv",
            FileKind::Document => "pdf",
            FileKind::Image => "image",
        }
    }
}

/// Extension first, magic bytes as fallback for files uploaded without a
/// usable name.
pub fn detect_kind(filename: &str, bytes: &[u8]) -> Option<FileKind> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("xlsx") | Some("xls") => return Some(FileKind::Spreadsheet),
        Some("csv") | Some("txt") => return Some(FileKind::DelimitedText),
        Some("pdf") => return Some(FileKind::Document),
        Some("jpg") | Some("jpeg") | Some("png") | Some("gif") => return Some(FileKind::Image),
        _ => {}
    }

    if bytes.starts_with(b"PK\x03\x04") {
        return Some(FileKind::Spreadsheet);
    }
    if bytes.starts_with(b"%PDF") {
        return Some(FileKind::Document);
    }
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47])
        || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"GIF8")
    {
        return Some(FileKind::Image);
    }
    if !bytes.is_empty() && std::str::from_utf8(bytes).is_ok() {
        return Some(FileKind::DelimitedText);
    }
    None
}

/// The normalized tabular form every upload converges to: rows of text
/// cells, written out as UTF-8 `;`-delimited lines with a lower-cased
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalTable {
    pub rows: Vec<Vec<String>>,
}

impl CanonicalTable {
    pub fn header(&self) -> Option<&[String]> {
        self.rows.first().map(|r| r.as_slice())
    }

    /// Header line included.
    pub fn line_count(&self) -> usize {
        self.rows.len()
    }

    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .from_path(path)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(|c| c.to_string()).collect());
        }
        Ok(CanonicalTable { rows })
    }
}

/// Spreadsheet decoding collaborator: computed cell values, row by row.
pub trait SpreadsheetReader {
    fn read_rows(&self, path: &Path) -> anyhow::Result<Vec<Vec<String>>>;
}

/// Page-layout text extraction collaborator (documents).
pub trait TextExtractor {
    fn extract_text(&self, path: &Path) -> anyhow::Result<String>;
}

/// Image-to-text collaborator. Used twice: primary OCR, then the
/// vision-API fallback.
pub trait OcrEngine {
    fn recognize(&self, path: &Path) -> anyhow::Result<String>;
}

pub struct Collaborators {
    pub spreadsheet: Box<dyn SpreadsheetReader>,
    pub text: Box<dyn TextExtractor>,
    pub ocr: Box<dyn OcrEngine>,
    pub vision: Box<dyn OcrEngine>,
}

fn column_splitter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s{2,}|\t").expect("column splitter regex"))
}

/// Columns in an extracted text dump are separated by runs of at least two
/// whitespace characters or a tab.
pub fn split_columns(line: &str) -> Vec<String> {
    column_splitter()
        .split(line.trim())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Linear text dump -> rows, skipping blank lines.
pub fn table_from_text(dump: &str) -> Vec<Vec<String>> {
    dump.lines()
        .filter(|l| !l.trim().is_empty())
        .map(split_columns)
        .collect()
}

fn read_delimited(path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let table = CanonicalTable::read_csv(path)?;
    Ok(table
        .rows
        .into_iter()
        .map(|row| row.into_iter().map(|c| c.trim().to_string()).collect())
        .collect())
}

fn non_empty(rows: &[Vec<String>]) -> bool {
    rows.iter().any(|r| r.iter().any(|c| !c.trim().is_empty()))
}

/// Dispatch a raw upload to its converter and produce the canonical table.
/// An unusable or empty result is a hard conversion failure; the job never
/// reaches validation with an empty table.
pub fn normalize_file(
    collab: &Collaborators,
    path: &Path,
    kind: FileKind,
) -> Result<CanonicalTable, CoreError> {
    let mut rows = match kind {
        FileKind::Spreadsheet => collab
            .spreadsheet
            .read_rows(path)
            .map_err(|e| CoreError::conversion(format!("spreadsheet conversion failed: {}", e)))?
            .into_iter()
            .map(|row| row.into_iter().map(|c| c.trim().to_string()).collect())
            .collect(),
        FileKind::DelimitedText => read_delimited(path)
            .map_err(|e| CoreError::conversion(format!("delimited read failed: {}", e)))?,
        FileKind::Document => {
            let dump = collab
                .text
                .extract_text(path)
                .map_err(|e| CoreError::conversion(format!("text extraction failed: {}", e)))?;
            table_from_text(&dump)
        }
        FileKind::Image => {
            let dump = match collab.ocr.recognize(path) {
                Ok(t) if !t.trim().is_empty() => t,
                primary => {
                    if let Err(e) = &primary {
                        tracing::debug!(error = %e, "primary ocr unavailable, trying vision fallback");
                    }
                    collab.vision.recognize(path).map_err(|e| {
                        CoreError::conversion(format!(
                            "ocr produced nothing and vision fallback failed: {}",
                            e
                        ))
                    })?
                }
            };
            table_from_text(&dump)
        }
    };

    if !non_empty(&rows) {
        return Err(CoreError::conversion("conversion produced an empty table"));
    }

    if let Some(header) = rows.first_mut() {
        for cell in header.iter_mut() {
            *cell = cell.trim().to_lowercase();
        }
    }

    Ok(CanonicalTable { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct StubSheet(Vec<Vec<String>>);
    impl SpreadsheetReader for StubSheet {
        fn read_rows(&self, _path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
            Ok(self.0.clone())
        }
    }

    struct StubText(&'static str);
    impl TextExtractor for StubText {
        fn extract_text(&self, _path: &Path) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct StubOcr(anyhow::Result<&'static str>);
    impl OcrEngine for StubOcr {
        fn recognize(&self, _path: &Path) -> anyhow::Result<String> {
            match &self.0 {
                Ok(t) => Ok(t.to_string()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    fn collab(
        sheet: Vec<Vec<String>>,
        text: &'static str,
        ocr: anyhow::Result<&'static str>,
        vision: anyhow::Result<&'static str>,
    ) -> Collaborators {
        Collaborators {
            spreadsheet: Box::new(StubSheet(sheet)),
            text: Box::new(StubText(text)),
            ocr: Box::new(StubOcr(ocr)),
            vision: Box::new(StubOcr(vision)),
        }
    }

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "bulletind-convert-{}-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos(),
            name
        ));
        std::fs::write(&p, contents).expect("write temp file");
        p
    }

    #[test]
    fn detects_kind_from_extension_then_magic() {
        assert_eq!(detect_kind("notes.xlsx", b""), Some(FileKind::Spreadsheet));
        assert_eq!(detect_kind("notes.csv", b""), Some(FileKind::DelimitedText));
        assert_eq!(detect_kind("scan.pdf", b""), Some(FileKind::Document));
        assert_eq!(detect_kind("photo.JPG", b""), Some(FileKind::Image));

        assert_eq!(detect_kind("blob", b"%PDF-1.4"), Some(FileKind::Document));
        assert_eq!(
            detect_kind("blob", &[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(FileKind::Image)
        );
        assert_eq!(detect_kind("blob", b"PK\x03\x04rest"), Some(FileKind::Spreadsheet));
        assert_eq!(detect_kind("blob", b"nom;prenoms"), Some(FileKind::DelimitedText));
        assert_eq!(detect_kind("blob", &[0x00, 0xFE, 0x01]), None);
    }

    #[test]
    fn splits_columns_on_whitespace_runs_and_tabs() {
        assert_eq!(
            split_columns("DUPONT  Jean   14,5"),
            vec!["DUPONT", "Jean", "14,5"]
        );
        assert_eq!(split_columns("a\tb\t\tc"), vec!["a", "b", "c"]);
        // single spaces stay inside a cell
        assert_eq!(split_columns("DE LA RUE  Paul"), vec!["DE LA RUE", "Paul"]);
    }

    #[test]
    fn text_dump_becomes_rows_without_blank_lines() {
        let dump = "matricule  note\n\nM001  15\n   \nM002  12\n";
        assert_eq!(
            table_from_text(dump),
            vec![
                vec!["matricule".to_string(), "note".to_string()],
                vec!["M001".to_string(), "15".to_string()],
                vec!["M002".to_string(), "12".to_string()],
            ]
        );
    }

    #[test]
    fn delimited_input_only_gets_header_lowercased() {
        let p = temp_file("roster.csv", "NOM;Prenoms;SEXE\nDupont;Jean;M\n");
        let c = collab(vec![], "", Ok(""), Ok(""));
        let table = normalize_file(&c, &p, FileKind::DelimitedText).expect("normalize");
        assert_eq!(
            table.rows[0],
            vec!["nom".to_string(), "prenoms".to_string(), "sexe".to_string()]
        );
        assert_eq!(table.rows[1][0], "Dupont");
        assert_eq!(table.line_count(), 2);
    }

    #[test]
    fn spreadsheet_rows_come_from_the_reader_collaborator() {
        let p = temp_file("notes.xlsx", "ignored");
        let c = collab(
            vec![
                vec!["Matricule".into(), "Note".into()],
                vec!["M001".into(), "15".into()],
            ],
            "",
            Ok(""),
            Ok(""),
        );
        let table = normalize_file(&c, &p, FileKind::Spreadsheet).expect("normalize");
        assert_eq!(table.rows[0], vec!["matricule".to_string(), "note".to_string()]);
        assert_eq!(table.rows[1], vec!["M001".to_string(), "15".to_string()]);
    }

    #[test]
    fn image_falls_back_to_vision_when_ocr_is_unavailable() {
        let p = temp_file("scan.png", "ignored");
        let c = collab(
            vec![],
            "",
            Err(anyhow::anyhow!("tesseract missing")),
            Ok("matricule  note\nM001  15"),
        );
        let table = normalize_file(&c, &p, FileKind::Image).expect("normalize");
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn image_falls_back_to_vision_on_empty_ocr_dump() {
        let p = temp_file("scan2.png", "ignored");
        let c = collab(vec![], "", Ok("   \n"), Ok("matricule  note\nM001  15"));
        let table = normalize_file(&c, &p, FileKind::Image).expect("normalize");
        assert_eq!(table.rows[1], vec!["M001".to_string(), "15".to_string()]);
    }

    #[test]
    fn conversion_fails_hard_when_everything_is_empty() {
        let p = temp_file("scan3.png", "ignored");
        let c = collab(
            vec![],
            "",
            Err(anyhow::anyhow!("no ocr")),
            Err(anyhow::anyhow!("no vision")),
        );
        let e = normalize_file(&c, &p, FileKind::Image).unwrap_err();
        assert_eq!(e.code, "conversion_failed");

        let c = collab(vec![], "", Ok(""), Ok("\n  \n"));
        let e = normalize_file(&c, &p, FileKind::Image).unwrap_err();
        assert_eq!(e.code, "conversion_failed");
    }

    #[test]
    fn canonical_csv_round_trips_with_semicolons() {
        let table = CanonicalTable {
            rows: vec![
                vec!["nom".into(), "prenoms".into()],
                vec!["Dupont".into(), "Jean".into()],
            ],
        };
        let p = std::env::temp_dir().join(format!(
            "bulletind-canon-{}.csv",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        table.write_csv(&p).expect("write");
        let text = std::fs::read_to_string(&p).expect("read raw");
        assert!(text.starts_with("nom;prenoms"));
        assert_eq!(CanonicalTable::read_csv(&p).expect("read"), table);
    }
}
