use crate::error::CoreError;
use rusqlite::Connection;
use std::fs::File;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub entry_count: usize,
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Zip every stored bulletin artifact of a class for one school year.
/// Entries are named `<nom>_<prenoms>_<periode>_<basename>`; artifacts
/// whose file vanished are skipped.
pub fn export_class_archive(
    conn: &Connection,
    classe_id: &str,
    annee_id: &str,
    out_path: &Path,
) -> Result<ArchiveSummary, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT b.fichier_pdf, el.nom, el.prenoms, p.nom
         FROM bulletins b
         JOIN eleves el ON b.eleve_id = el.id
         JOIN periodes p ON b.periode_id = p.id
         WHERE el.classe_id = ? AND p.annee_scolaire_id = ?
           AND b.fichier_pdf IS NOT NULL
         ORDER BY el.nom, el.prenoms, p.ordre",
    )?;
    let rows: Vec<(String, String, String, String)> = stmt
        .query_map((classe_id, annee_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    if rows.is_empty() {
        return Err(CoreError::not_found(
            "no bulletins for this class and school year",
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CoreError::new("io_failed", e.to_string()))?;
    }
    let out_file = File::create(out_path).map_err(|e| {
        CoreError::new(
            "io_failed",
            format!("cannot create {}: {}", out_path.to_string_lossy(), e),
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entry_count = 0_usize;
    for (artifact, nom, prenoms, periode_nom) in rows {
        let artifact_path = Path::new(&artifact);
        if !artifact_path.is_file() {
            tracing::warn!(path = %artifact, "bulletin artifact missing, skipped");
            continue;
        }
        let basename = artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "bulletin".to_string());
        let entry_name = format!(
            "{}_{}_{}_{}",
            sanitize(&nom),
            sanitize(&prenoms),
            sanitize(&periode_nom),
            basename
        );

        zip.start_file(entry_name, opts)
            .map_err(|e| CoreError::new("io_failed", e.to_string()))?;
        let mut src = File::open(artifact_path)
            .map_err(|e| CoreError::new("io_failed", e.to_string()))?;
        std::io::copy(&mut src, &mut zip)
            .map_err(|e| CoreError::new("io_failed", e.to_string()))?;
        entry_count += 1;
    }

    zip.finish()
        .map_err(|e| CoreError::new("io_failed", e.to_string()))?;

    Ok(ArchiveSummary { entry_count })
}
