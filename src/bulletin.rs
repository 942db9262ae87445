use crate::calc::{self, ClassSheet, SubjectAverage};
use crate::error::CoreError;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentIdentity {
    pub eleve_id: String,
    pub nom: String,
    pub prenoms: String,
    pub matricule: String,
    pub classe_id: String,
    pub classe_nom: String,
    pub etablissement_nom: String,
}

/// Everything the rendering collaborator needs; layout is its business.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinData {
    pub identity: StudentIdentity,
    pub periode_id: String,
    pub periode_nom: String,
    pub subjects: Vec<SubjectAverage>,
    pub moyenne_generale: Option<f64>,
    pub rang_classe: Option<i64>,
    pub effectif: usize,
}

pub trait BulletinRenderer {
    fn render(&self, workspace: &Path, data: &BulletinData) -> anyhow::Result<PathBuf>;
}

/// Default artifact renderer: a plain-text report card under
/// `bulletins/` in the workspace. Typesetting fidelity is out of scope;
/// the data set is the contract.
pub struct TextBulletinRenderer;

impl BulletinRenderer for TextBulletinRenderer {
    fn render(&self, workspace: &Path, data: &BulletinData) -> anyhow::Result<PathBuf> {
        let dir = workspace.join("bulletins");
        std::fs::create_dir_all(&dir)?;
        let filename = format!(
            "bulletin_{}_{}_{}.txt",
            data.identity.matricule,
            data.periode_id,
            Utc::now().format("%Y-%m-%d")
        );
        let path = dir.join(filename);

        let mut out = String::new();
        out.push_str(&format!("{}\n", data.identity.etablissement_nom));
        out.push_str(&format!("BULLETIN DE NOTES - {}\n\n", data.periode_nom));
        out.push_str(&format!(
            "Nom : {}    Prénoms : {}\n",
            data.identity.nom, data.identity.prenoms
        ));
        out.push_str(&format!(
            "Matricule : {}    Classe : {}\n\n",
            data.identity.matricule, data.identity.classe_nom
        ));
        out.push_str(&format!(
            "{:<28} {:>8} {:>6} {:>8}\n",
            "MATIERE", "MOYENNE", "COEFF", "TOTAL"
        ));
        for s in &data.subjects {
            let (moyenne, total) = match s.moyenne {
                Some(m) => (
                    format!("{:.2}", m),
                    format!("{:.2}", m * s.coefficient),
                ),
                None => ("-".to_string(), "-".to_string()),
            };
            out.push_str(&format!(
                "{:<28} {:>8} {:>6} {:>8}\n",
                s.matiere_nom, moyenne, s.coefficient, total
            ));
        }
        out.push('\n');
        match data.moyenne_generale {
            Some(m) => out.push_str(&format!("Moyenne Générale : {:.2}\n", m)),
            None => out.push_str("Moyenne Générale : N/A\n"),
        }
        if let Some(r) = data.rang_classe {
            out.push_str(&format!("Rang : {} / {}\n", r, data.effectif));
        }

        std::fs::write(&path, out)?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinRecord {
    pub bulletin_id: String,
    pub eleve_id: String,
    pub periode_id: String,
    pub moyenne_generale: Option<f64>,
    pub rang_classe: Option<i64>,
    pub fichier_pdf: String,
    pub genere_le: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentFailure {
    pub eleve_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGeneration {
    pub bulletins: Vec<BulletinRecord>,
    pub failures: Vec<StudentFailure>,
}

fn load_identity(conn: &Connection, eleve_id: &str) -> Result<StudentIdentity, CoreError> {
    conn.query_row(
        "SELECT el.id, el.nom, el.prenoms, el.matricule, c.id, c.nom, et.nom
         FROM eleves el
         JOIN classes c ON el.classe_id = c.id
         JOIN etablissements et ON c.etablissement_id = et.id
         WHERE el.id = ?",
        [eleve_id],
        |r| {
            Ok(StudentIdentity {
                eleve_id: r.get(0)?,
                nom: r.get(1)?,
                prenoms: r.get(2)?,
                matricule: r.get(3)?,
                classe_id: r.get(4)?,
                classe_nom: r.get(5)?,
                etablissement_nom: r.get(6)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found(format!("eleve {} not found", eleve_id)))
}

fn load_periode_nom(conn: &Connection, periode_id: &str) -> Result<String, CoreError> {
    conn.query_row("SELECT nom FROM periodes WHERE id = ?", [periode_id], |r| {
        r.get(0)
    })
    .optional()?
    .ok_or_else(|| CoreError::not_found(format!("periode {} not found", periode_id)))
}

fn upsert_bulletin(
    conn: &Connection,
    eleve_id: &str,
    periode_id: &str,
    moyenne: Option<f64>,
    rang: Option<i64>,
    artifact: &str,
    genere_par: Option<&str>,
    genere_le: &str,
) -> Result<String, CoreError> {
    let new_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO bulletins(id, eleve_id, periode_id, moyenne_generale, rang_classe,
                               fichier_pdf, genere_par, genere_le)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(eleve_id, periode_id) DO UPDATE SET
           moyenne_generale = excluded.moyenne_generale,
           rang_classe = excluded.rang_classe,
           fichier_pdf = excluded.fichier_pdf,
           genere_par = excluded.genere_par,
           genere_le = excluded.genere_le",
        (
            &new_id, eleve_id, periode_id, moyenne, rang, artifact, genere_par, genere_le,
        ),
    )?;
    // The upsert keeps the original row id on regeneration; read it back.
    let id: String = conn.query_row(
        "SELECT id FROM bulletins WHERE eleve_id = ? AND periode_id = ?",
        (eleve_id, periode_id),
        |r| r.get(0),
    )?;
    Ok(id)
}

fn generate_from_sheet(
    conn: &Connection,
    renderer: &dyn BulletinRenderer,
    workspace: &Path,
    identity: &StudentIdentity,
    periode_id: &str,
    periode_nom: &str,
    sheet: &ClassSheet,
    genere_par: Option<&str>,
) -> Result<BulletinRecord, CoreError> {
    // Students outside the enrolled pool still get a bulletin, computed
    // from their own notes; they just never enter the ranking.
    let subjects = {
        let from_sheet = sheet.subjects(&identity.eleve_id);
        if from_sheet.is_empty() {
            calc::load_student_subjects(conn, &identity.eleve_id, periode_id)?
        } else {
            from_sheet.to_vec()
        }
    };

    let moyenne = calc::general_average(&subjects);
    let pool = sheet.ranked_pool();
    let rang = calc::competition_rank(moyenne, &pool);

    let data = BulletinData {
        identity: identity.clone(),
        periode_id: periode_id.to_string(),
        periode_nom: periode_nom.to_string(),
        subjects,
        moyenne_generale: moyenne,
        rang_classe: rang,
        effectif: pool.len(),
    };
    let artifact = renderer
        .render(workspace, &data)
        .map_err(|e| CoreError::new("io_failed", format!("bulletin rendering failed: {}", e)))?;
    let artifact = artifact.to_string_lossy().to_string();

    let genere_le = Utc::now().to_rfc3339();
    let bulletin_id = upsert_bulletin(
        conn,
        &identity.eleve_id,
        periode_id,
        moyenne,
        rang,
        &artifact,
        genere_par,
        &genere_le,
    )?;

    tracing::info!(
        bulletin_id = %bulletin_id,
        eleve_id = %identity.eleve_id,
        periode_id = %periode_id,
        "bulletin generated"
    );

    Ok(BulletinRecord {
        bulletin_id,
        eleve_id: identity.eleve_id.clone(),
        periode_id: periode_id.to_string(),
        moyenne_generale: moyenne,
        rang_classe: rang,
        fichier_pdf: artifact,
        genere_le,
    })
}

/// One student, one period. Regeneration upserts the `(eleve, periode)`
/// bulletin and overwrites the artifact; it never inserts a second row.
pub fn generate_bulletin(
    conn: &Connection,
    renderer: &dyn BulletinRenderer,
    workspace: &Path,
    eleve_id: &str,
    periode_id: &str,
    genere_par: Option<&str>,
) -> Result<BulletinRecord, CoreError> {
    let identity = load_identity(conn, eleve_id)?;
    let periode_nom = load_periode_nom(conn, periode_id)?;
    let sheet = calc::load_class_sheet(conn, &identity.classe_id, periode_id)?;
    generate_from_sheet(
        conn,
        renderer,
        workspace,
        &identity,
        periode_id,
        &periode_nom,
        &sheet,
        genere_par,
    )
}

/// Whole class: the averages of every enrolled classmate are computed once
/// and shared across all bulletins. A failure on one student is collected
/// and the loop continues.
pub fn generate_for_class(
    conn: &Connection,
    renderer: &dyn BulletinRenderer,
    workspace: &Path,
    classe_id: &str,
    periode_id: &str,
    genere_par: Option<&str>,
) -> Result<ClassGeneration, CoreError> {
    let class_exists: Option<String> = conn
        .query_row("SELECT id FROM classes WHERE id = ?", [classe_id], |r| {
            r.get(0)
        })
        .optional()?;
    if class_exists.is_none() {
        return Err(CoreError::not_found(format!("classe {} not found", classe_id)));
    }
    let periode_nom = load_periode_nom(conn, periode_id)?;

    let mut stmt = conn.prepare(
        "SELECT id FROM eleves
         WHERE classe_id = ? AND statut = 'inscrit'
         ORDER BY nom, prenoms",
    )?;
    let eleve_ids: Vec<String> = stmt
        .query_map([classe_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let sheet = calc::load_class_sheet(conn, classe_id, periode_id)?;

    let mut bulletins = Vec::new();
    let mut failures = Vec::new();
    for eleve_id in eleve_ids {
        let result = load_identity(conn, &eleve_id).and_then(|identity| {
            generate_from_sheet(
                conn,
                renderer,
                workspace,
                &identity,
                periode_id,
                &periode_nom,
                &sheet,
                genere_par,
            )
        });
        match result {
            Ok(record) => bulletins.push(record),
            Err(e) => {
                tracing::warn!(eleve_id = %eleve_id, code = %e.code, "bulletin generation failed");
                failures.push(StudentFailure {
                    eleve_id,
                    code: e.code,
                    message: e.message,
                });
            }
        }
    }

    Ok(ClassGeneration { bulletins, failures })
}
