use crate::convert::{self, CanonicalTable, Collaborators, FileKind};
use crate::error::CoreError;
use crate::validate::{self, ImportTarget};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

/// Persisted lifecycle. `en_cours` covers upload + conversion; `importe`
/// and `erreur` are terminal for the stored status. The status only moves
/// forward; a retry is a new commit attempt on the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatut {
    EnCours,
    Converti,
    Importe,
    Erreur,
}

impl ImportStatut {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatut::EnCours => "en_cours",
            ImportStatut::Converti => "converti",
            ImportStatut::Importe => "importe",
            ImportStatut::Erreur => "erreur",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "en_cours" => Some(ImportStatut::EnCours),
            "converti" => Some(ImportStatut::Converti),
            "importe" => Some(ImportStatut::Importe),
            "erreur" => Some(ImportStatut::Erreur),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub nom_fichier: String,
    pub type_fichier: String,
    pub statut: String,
    pub chemin_original: String,
    pub chemin_csv: Option<String>,
    pub cible: Option<String>,
    pub classe_id: Option<String>,
    pub nombre_lignes: i64,
    pub nombre_erreurs: i64,
    pub details_erreurs: Vec<String>,
    pub importe_par: Option<String>,
    pub empreinte_sha256: Option<String>,
    pub created_at: String,
}

impl ImportJob {
    pub fn statut_enum(&self) -> Result<ImportStatut, CoreError> {
        ImportStatut::parse(&self.statut)
            .ok_or_else(|| CoreError::storage(format!("unknown import statut '{}'", self.statut)))
    }
}

pub fn load_job(conn: &Connection, job_id: &str) -> Result<ImportJob, CoreError> {
    conn.query_row(
        "SELECT id, nom_fichier, type_fichier, statut, chemin_original, chemin_csv,
                cible, classe_id, nombre_lignes, nombre_erreurs, details_erreurs,
                importe_par, empreinte_sha256, created_at
         FROM imports_fichiers WHERE id = ?",
        [job_id],
        |r| {
            let details_raw: String = r.get(10)?;
            Ok(ImportJob {
                id: r.get(0)?,
                nom_fichier: r.get(1)?,
                type_fichier: r.get(2)?,
                statut: r.get(3)?,
                chemin_original: r.get(4)?,
                chemin_csv: r.get(5)?,
                cible: r.get(6)?,
                classe_id: r.get(7)?,
                nombre_lignes: r.get(8)?,
                nombre_erreurs: r.get(9)?,
                details_erreurs: serde_json::from_str(&details_raw).unwrap_or_default(),
                importe_par: r.get(11)?,
                empreinte_sha256: r.get(12)?,
                created_at: r.get(13)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found(format!("import {} not found", job_id)))
}

fn store_findings(
    conn: &Connection,
    job_id: &str,
    statut: ImportStatut,
    chemin_csv: Option<&str>,
    cible: Option<ImportTarget>,
    nombre_lignes: i64,
    errors: &[String],
) -> Result<(), CoreError> {
    let details =
        serde_json::to_string(errors).map_err(|e| CoreError::storage(e.to_string()))?;
    conn.execute(
        "UPDATE imports_fichiers
         SET statut = ?, chemin_csv = COALESCE(?, chemin_csv),
             cible = COALESCE(?, cible),
             nombre_lignes = ?, nombre_erreurs = ?, details_erreurs = ?
         WHERE id = ?",
        (
            statut.as_str(),
            chemin_csv,
            cible.map(|t| t.as_str()),
            nombre_lignes,
            errors.len() as i64,
            details,
            job_id,
        ),
    )?;
    Ok(())
}

fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Upload entry point: record the job, convert to the canonical table,
/// run validation, land on `converti` or `erreur`. Validation findings are
/// recorded but never block the `converti` transition.
pub fn submit_import(
    conn: &Connection,
    collab: &Collaborators,
    workspace: &Path,
    src_path: &Path,
    declared_kind: Option<FileKind>,
    classe_id: Option<&str>,
    importe_par: Option<&str>,
) -> Result<ImportJob, CoreError> {
    let bytes = std::fs::read(src_path).map_err(|e| {
        CoreError::new(
            "io_failed",
            format!("cannot read {}: {}", src_path.to_string_lossy(), e),
        )
    })?;
    let nom_fichier = src_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| src_path.to_string_lossy().to_string());

    let kind = declared_kind.or_else(|| convert::detect_kind(&nom_fichier, &bytes));
    let type_fichier = kind.map(|k| k.as_str()).unwrap_or("inconnu");

    let job_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO imports_fichiers(id, nom_fichier, type_fichier, statut, chemin_original,
                                      classe_id, importe_par, empreinte_sha256, created_at)
         VALUES(?, ?, ?, 'en_cours', ?, ?, ?, ?, ?)",
        (
            &job_id,
            &nom_fichier,
            type_fichier,
            src_path.to_string_lossy().to_string(),
            classe_id,
            importe_par,
            fingerprint(&bytes),
            Utc::now().to_rfc3339(),
        ),
    )?;
    tracing::info!(job_id = %job_id, file = %nom_fichier, kind = type_fichier, "import submitted");

    let Some(kind) = kind else {
        store_findings(
            conn,
            &job_id,
            ImportStatut::Erreur,
            None,
            None,
            0,
            &["type de fichier non supporté".to_string()],
        )?;
        return load_job(conn, &job_id);
    };

    match convert::normalize_file(collab, src_path, kind) {
        Ok(table) => {
            let imports_dir = workspace.join("imports");
            std::fs::create_dir_all(&imports_dir)
                .map_err(|e| CoreError::new("io_failed", e.to_string()))?;
            let csv_path = imports_dir.join(format!("{}.csv", job_id));
            table
                .write_csv(&csv_path)
                .map_err(|e| CoreError::new("io_failed", e.to_string()))?;

            let (target, report) = validate::validate_table(&table);
            store_findings(
                conn,
                &job_id,
                ImportStatut::Converti,
                Some(&csv_path.to_string_lossy()),
                Some(target),
                report.line_count as i64,
                &report.errors,
            )?;
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "conversion failed");
            store_findings(
                conn,
                &job_id,
                ImportStatut::Erreur,
                None,
                None,
                0,
                &[e.message.clone()],
            )?;
        }
    }

    load_job(conn, &job_id)
}

enum RowOutcome {
    Applied,
    Rejected(String),
}

fn cell<'a>(row: &'a [String], idx: Option<usize>) -> Option<&'a str> {
    idx.and_then(|i| row.get(i)).map(|c| c.trim())
}

/// Enrollment numbers for roster rows that arrive without one. Derived
/// from the identity so a re-commit resolves to the same student.
fn derive_matricule(classe_id: &str, nom: &str, prenoms: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(classe_id.as_bytes());
    hasher.update(b"|");
    hasher.update(nom.to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(prenoms.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let mut code = String::from("ELV-");
    for b in digest.iter().take(4) {
        code.push_str(&format!("{:02X}", b));
    }
    code
}

struct NoteColumns {
    matricule: usize,
    matiere: usize,
    evaluation: usize,
    note: usize,
}

fn note_columns(header: &[String]) -> Result<NoteColumns, CoreError> {
    let find = |name: &str| header.iter().position(|h| h == name);
    match (
        find("matricule"),
        find("matiere"),
        find("evaluation"),
        find("note"),
    ) {
        (Some(matricule), Some(matiere), Some(evaluation), Some(note)) => Ok(NoteColumns {
            matricule,
            matiere,
            evaluation,
            note,
        }),
        _ => Err(CoreError::new(
            "validation_failed",
            "en-têtes manquants pour un import de notes",
        )),
    }
}

fn commit_note_row(
    conn: &Connection,
    cols: &NoteColumns,
    row: &[String],
    saisie_par: Option<&str>,
) -> Result<RowOutcome, CoreError> {
    let matricule = match cell(row, Some(cols.matricule)) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(RowOutcome::Rejected("matricule manquant".to_string())),
    };
    let matiere = match cell(row, Some(cols.matiere)) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(RowOutcome::Rejected("matiere manquante".to_string())),
    };
    let titre = match cell(row, Some(cols.evaluation)) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(RowOutcome::Rejected("evaluation manquante".to_string())),
    };

    let note_cell = cell(row, Some(cols.note)).unwrap_or("");
    let note = if note_cell.is_empty() {
        None
    } else {
        match validate::parse_note(note_cell) {
            Some(v) if (0.0..=20.0).contains(&v) => Some(v),
            _ => {
                return Ok(RowOutcome::Rejected(format!(
                    "note invalide ({})",
                    note_cell
                )))
            }
        }
    };

    let eleve_id: Option<String> = conn
        .query_row(
            "SELECT id FROM eleves WHERE matricule = ?",
            [matricule],
            |r| r.get(0),
        )
        .optional()?;
    let Some(eleve_id) = eleve_id else {
        return Ok(RowOutcome::Rejected(format!(
            "matricule inconnu ({})",
            matricule
        )));
    };

    let matiere_id: Option<String> = conn
        .query_row(
            "SELECT id FROM matieres WHERE lower(nom) = lower(?)",
            [matiere],
            |r| r.get(0),
        )
        .optional()?;
    let Some(matiere_id) = matiere_id else {
        return Ok(RowOutcome::Rejected(format!(
            "matiere inconnue ({})",
            matiere
        )));
    };

    let mut stmt = conn.prepare(
        "SELECT id FROM evaluations WHERE matiere_id = ? AND lower(titre) = lower(?) LIMIT 2",
    )?;
    let eval_ids: Vec<String> = stmt
        .query_map((matiere_id.as_str(), titre), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    let evaluation_id = match eval_ids.as_slice() {
        [only] => only.clone(),
        [] => {
            return Ok(RowOutcome::Rejected(format!(
                "evaluation inconnue ({})",
                titre
            )))
        }
        _ => {
            return Ok(RowOutcome::Rejected(format!(
                "evaluation ambiguë ({})",
                titre
            )))
        }
    };

    // Natural key (eleve, evaluation): a re-commit overwrites rather than
    // duplicating.
    let note_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notes(id, eleve_id, evaluation_id, note, statut, saisie_par)
         VALUES(?, ?, ?, ?, 'present', ?)
         ON CONFLICT(eleve_id, evaluation_id) DO UPDATE SET
           note = excluded.note,
           statut = excluded.statut,
           saisie_par = excluded.saisie_par",
        (&note_id, &eleve_id, &evaluation_id, note, saisie_par),
    )?;
    Ok(RowOutcome::Applied)
}

fn commit_roster_row(
    conn: &Connection,
    header: &[String],
    row: &[String],
    classe_id: &str,
) -> Result<RowOutcome, CoreError> {
    let find = |name: &str| header.iter().position(|h| h == name);
    let nom = match cell(row, find("nom")) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(RowOutcome::Rejected("nom manquant".to_string())),
    };
    let prenoms = match cell(row, find("prenoms")) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(RowOutcome::Rejected("prenoms manquants".to_string())),
    };
    let sexe = cell(row, find("sexe")).filter(|v| !v.is_empty());
    let date_naissance = cell(row, find("date_naissance")).filter(|v| !v.is_empty());
    let matricule = match cell(row, find("matricule")).filter(|v| !v.is_empty()) {
        Some(v) => v.to_string(),
        None => derive_matricule(classe_id, nom, prenoms),
    };

    let eleve_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO eleves(id, classe_id, nom, prenoms, sexe, matricule, statut, date_naissance)
         VALUES(?, ?, ?, ?, ?, ?, 'inscrit', ?)
         ON CONFLICT(matricule) DO UPDATE SET
           classe_id = excluded.classe_id,
           nom = excluded.nom,
           prenoms = excluded.prenoms,
           sexe = excluded.sexe,
           statut = excluded.statut,
           date_naissance = excluded.date_naissance",
        (
            &eleve_id,
            classe_id,
            nom,
            prenoms,
            sexe,
            &matricule,
            date_naissance,
        ),
    )?;
    Ok(RowOutcome::Applied)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub imported: usize,
    pub errors: usize,
    pub error_details: Vec<String>,
}

/// Apply a converted table into the store. Rows are independent: a bad row
/// is recorded and the loop continues; only a systemic storage failure
/// aborts. Completion means `importe` even with row errors.
pub fn commit_import(
    conn: &Connection,
    job_id: &str,
) -> Result<(ImportJob, CommitOutcome), CoreError> {
    let job = load_job(conn, job_id)?;
    match job.statut_enum()? {
        ImportStatut::Converti | ImportStatut::Importe => {}
        other => {
            return Err(CoreError::invalid_transition(format!(
                "commit requires statut 'converti', job is '{}'",
                other.as_str()
            )));
        }
    }

    let Some(csv_path) = job.chemin_csv.as_deref() else {
        return Err(CoreError::storage("job has no canonical table"));
    };
    let table = CanonicalTable::read_csv(Path::new(csv_path)).map_err(|e| {
        CoreError::storage(format!("canonical table unreadable: {}", e))
    })?;
    let Some(header) = table.header().map(|h| h.to_vec()) else {
        return Err(CoreError::storage("canonical table is empty"));
    };

    let target = job
        .cible
        .as_deref()
        .and_then(ImportTarget::parse)
        .unwrap_or_else(|| validate::detect_target(&header));

    let roster_classe = if target == ImportTarget::Eleves {
        match job.classe_id.as_deref() {
            Some(c) => Some(c.to_string()),
            None => {
                return Err(CoreError::new(
                    "validation_failed",
                    "import d'élèves sans classe cible",
                ))
            }
        }
    } else {
        None
    };
    let note_cols = if target == ImportTarget::Notes {
        Some(note_columns(&header)?)
    } else {
        None
    };

    let mut imported = 0_usize;
    let mut errors: Vec<String> = Vec::new();
    for (i, row) in table.rows.iter().enumerate().skip(1) {
        let line = i + 1;
        let outcome = match target {
            ImportTarget::Notes => commit_note_row(
                conn,
                note_cols.as_ref().expect("note columns"),
                row,
                job.importe_par.as_deref(),
            ),
            ImportTarget::Eleves => commit_roster_row(
                conn,
                &header,
                row,
                roster_classe.as_deref().expect("roster classe"),
            ),
        };
        match outcome {
            Ok(RowOutcome::Applied) => imported += 1,
            Ok(RowOutcome::Rejected(reason)) => {
                errors.push(format!("ligne {}: {}", line, reason));
            }
            Err(e) => {
                // Systemic: mark the job failed with what we have and
                // surface the storage error.
                errors.push(format!("ligne {}: {}", line, e.message));
                let _ = store_findings(
                    conn,
                    job_id,
                    ImportStatut::Erreur,
                    None,
                    Some(target),
                    job.nombre_lignes,
                    &errors,
                );
                return Err(e);
            }
        }
    }

    store_findings(
        conn,
        job_id,
        ImportStatut::Importe,
        None,
        Some(target),
        job.nombre_lignes,
        &errors,
    )?;
    tracing::info!(
        job_id = %job_id,
        imported,
        errors = errors.len(),
        "import committed"
    );

    let job = load_job(conn, job_id)?;
    let outcome = CommitOutcome {
        imported,
        errors: errors.len(),
        error_details: errors,
    };
    Ok((job, outcome))
}

/// Abandon a live job: straight to `erreur` with a snapshot note. Rows
/// already committed stay committed.
pub fn cancel_import(conn: &Connection, job_id: &str) -> Result<ImportJob, CoreError> {
    let job = load_job(conn, job_id)?;
    match job.statut_enum()? {
        ImportStatut::EnCours | ImportStatut::Converti => {}
        other => {
            return Err(CoreError::invalid_transition(format!(
                "cannot cancel a job in statut '{}'",
                other.as_str()
            )));
        }
    }

    let mut details = job.details_erreurs.clone();
    details.push("import abandonné par l'utilisateur".to_string());
    store_findings(
        conn,
        job_id,
        ImportStatut::Erreur,
        None,
        None,
        job.nombre_lignes,
        &details,
    )?;
    load_job(conn, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace() -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "bulletind-import-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn insert_job(conn: &Connection, statut: &str) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO imports_fichiers(id, nom_fichier, type_fichier, statut,
                                          chemin_original, created_at)
             VALUES(?, 'x.csv', 'csv', ?, '/tmp/x.csv', ?)",
            (&id, statut, Utc::now().to_rfc3339()),
        )
        .expect("insert job");
        id
    }

    #[test]
    fn commit_is_rejected_unless_converted() {
        let ws = temp_workspace();
        let conn = crate::db::open_db(&ws).expect("open db");

        for statut in ["en_cours", "erreur"] {
            let id = insert_job(&conn, statut);
            let e = commit_import(&conn, &id).unwrap_err();
            assert_eq!(e.code, "invalid_transition", "statut {}", statut);
        }
    }

    #[test]
    fn cancel_only_applies_to_live_jobs() {
        let ws = temp_workspace();
        let conn = crate::db::open_db(&ws).expect("open db");

        let id = insert_job(&conn, "en_cours");
        let job = cancel_import(&conn, &id).expect("cancel");
        assert_eq!(job.statut, "erreur");
        assert!(job
            .details_erreurs
            .iter()
            .any(|d| d.contains("abandonné")));

        let id = insert_job(&conn, "importe");
        assert_eq!(
            cancel_import(&conn, &id).unwrap_err().code,
            "invalid_transition"
        );
    }

    #[test]
    fn derived_matricules_are_stable_per_identity() {
        let a = derive_matricule("c1", "Dupont", "Jean");
        let b = derive_matricule("c1", "dupont", "jean");
        let c = derive_matricule("c1", "Martin", "Jean");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("ELV-"));
    }

    #[test]
    fn unknown_statut_is_a_storage_error() {
        let ws = temp_workspace();
        let conn = crate::db::open_db(&ws).expect("open db");
        let id = insert_job(&conn, "n_importe_quoi");
        assert_eq!(commit_import(&conn, &id).unwrap_err().code, "storage_failed");
    }
}
