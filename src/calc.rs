use crate::error::CoreError;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

/// All averages live on the 0-20 scale of the bulletin.
pub const NOTE_SCALE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteStatut {
    Present,
    Absent,
    Exempte,
}

impl NoteStatut {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(NoteStatut::Present),
            "absent" => Some(NoteStatut::Absent),
            "exempte" => Some(NoteStatut::Exempte),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NoteStatut::Present => "present",
            NoteStatut::Absent => "absent",
            NoteStatut::Exempte => "exempte",
        }
    }
}

/// One grade entry as seen by the calculators: the raw mark, the scale it
/// was taken on and the coefficient of its evaluation type.
#[derive(Debug, Clone, Copy)]
pub struct GradeSample {
    pub note: Option<f64>,
    pub statut: NoteStatut,
    pub note_sur: f64,
    pub coefficient: f64,
}

/// Bulletin rounding rule: 2 decimals, half away from zero.
pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Averages are compared at 2-decimal precision. Comparing centi-points as
/// integers keeps ranking stable against float noise.
fn centi(x: f64) -> i64 {
    (x * 100.0).round() as i64
}

pub fn normalize_to_20(raw: f64, note_sur: f64) -> Result<f64, CoreError> {
    if note_sur <= 0.0 {
        return Err(CoreError::invalid_score(format!(
            "note_sur must be > 0, got {}",
            note_sur
        )));
    }
    Ok(raw * NOTE_SCALE / note_sur)
}

/// `Σ(value × coeff) / Σ(coeff)`, `None` when no pair carries weight.
fn weighted_average(pairs: impl IntoIterator<Item = (f64, f64)>) -> Option<f64> {
    let mut points = 0.0_f64;
    let mut coeffs = 0.0_f64;
    for (value, coeff) in pairs {
        points += value * coeff;
        coeffs += coeff;
    }
    if coeffs > 0.0 {
        Some(points / coeffs)
    } else {
        None
    }
}

/// Per-subject average over the entries of one (student, subject, period).
/// Only `present` entries with a mark participate; an empty set yields
/// `None`, never 0.
pub fn subject_average(samples: &[GradeSample]) -> Result<Option<f64>, CoreError> {
    let mut pairs: Vec<(f64, f64)> = Vec::new();
    for s in samples {
        if s.statut != NoteStatut::Present {
            continue;
        }
        let Some(raw) = s.note else {
            continue;
        };
        pairs.push((normalize_to_20(raw, s.note_sur)?, s.coefficient));
    }
    Ok(weighted_average(pairs).map(round_2dp))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub matiere_id: String,
    pub matiere_nom: String,
    pub coefficient: f64,
    pub moyenne: Option<f64>,
}

/// General average across subjects, weighted by each subject's own
/// coefficient. Subjects without an average are skipped, never counted
/// as 0.
pub fn general_average(subjects: &[SubjectAverage]) -> Option<f64> {
    weighted_average(
        subjects
            .iter()
            .filter_map(|s| s.moyenne.map(|m| (m, s.coefficient))),
    )
    .map(round_2dp)
}

/// Competition ranking: rank = 1 + count of strictly greater averages.
/// Tied students share a rank; the next distinct average takes the rank
/// that counts everyone above it.
pub fn competition_rank(target: Option<f64>, class_averages: &[f64]) -> Option<i64> {
    let target = target?;
    if class_averages.is_empty() {
        return None;
    }
    let t = centi(target);
    let greater = class_averages.iter().filter(|&&m| centi(m) > t).count();
    Some(greater as i64 + 1)
}

struct NoteLine {
    eleve_id: String,
    matiere_id: String,
    matiere_nom: String,
    matiere_coeff: f64,
    sample: GradeSample,
}

/// Every grade of a class for one period, grouped per student. Loaded in a
/// single query so class-wide generation ranks from one shared average set
/// instead of recomputing per student.
pub struct ClassSheet {
    subjects_by_student: HashMap<String, Vec<SubjectAverage>>,
}

impl ClassSheet {
    pub fn subjects(&self, eleve_id: &str) -> &[SubjectAverage] {
        self.subjects_by_student
            .get(eleve_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn general_averages(&self) -> HashMap<String, Option<f64>> {
        self.subjects_by_student
            .iter()
            .map(|(id, subjects)| (id.clone(), general_average(subjects)))
            .collect()
    }

    /// The non-null averages the ranking phase compares against.
    pub fn ranked_pool(&self) -> Vec<f64> {
        self.subjects_by_student
            .values()
            .filter_map(|subjects| general_average(subjects))
            .collect()
    }
}

const NOTE_LINES_SQL: &str = "SELECT n.eleve_id, m.id, m.nom, m.coefficient,
        n.note, n.statut, e.note_sur, te.coefficient
 FROM notes n
 JOIN evaluations e ON n.evaluation_id = e.id
 JOIN types_evaluations te ON e.type_evaluation_id = te.id
 JOIN matieres m ON e.matiere_id = m.id
 JOIN eleves el ON n.eleve_id = el.id";

fn collect_note_lines(
    conn: &Connection,
    where_clause: &str,
    params: (&str, &str),
) -> Result<Vec<NoteLine>, CoreError> {
    let sql = format!("{} {}", NOTE_LINES_SQL, where_clause);
    let mut stmt = conn.prepare(&sql)?;
    let lines = stmt
        .query_map([params.0, params.1], |r| {
            let statut_raw: String = r.get(5)?;
            Ok((
                NoteLine {
                    eleve_id: r.get(0)?,
                    matiere_id: r.get(1)?,
                    matiere_nom: r.get(2)?,
                    matiere_coeff: r.get(3)?,
                    sample: GradeSample {
                        note: r.get(4)?,
                        statut: NoteStatut::Present,
                        note_sur: r.get(6)?,
                        coefficient: r.get(7)?,
                    },
                },
                statut_raw,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut out = Vec::with_capacity(lines.len());
    for (mut line, statut_raw) in lines {
        let statut = NoteStatut::parse(&statut_raw).ok_or_else(|| {
            CoreError::storage(format!("unknown note statut '{}'", statut_raw))
        })?;
        line.sample.statut = statut;
        out.push(line);
    }
    Ok(out)
}

fn group_subjects(lines: Vec<NoteLine>) -> Result<HashMap<String, Vec<SubjectAverage>>, CoreError> {
    // (eleve, matiere) -> samples, preserving subject identity.
    let mut samples: HashMap<(String, String), (String, f64, Vec<GradeSample>)> = HashMap::new();
    for line in lines {
        samples
            .entry((line.eleve_id, line.matiere_id))
            .or_insert_with(|| (line.matiere_nom, line.matiere_coeff, Vec::new()))
            .2
            .push(line.sample);
    }

    let mut by_student: HashMap<String, Vec<SubjectAverage>> = HashMap::new();
    for ((eleve_id, matiere_id), (matiere_nom, matiere_coeff, entries)) in samples {
        let moyenne = subject_average(&entries)?;
        by_student.entry(eleve_id).or_default().push(SubjectAverage {
            matiere_id,
            matiere_nom,
            coefficient: matiere_coeff,
            moyenne,
        });
    }
    for subjects in by_student.values_mut() {
        subjects.sort_by(|a, b| a.matiere_nom.cmp(&b.matiere_nom));
    }
    Ok(by_student)
}

pub fn load_class_sheet(
    conn: &Connection,
    classe_id: &str,
    periode_id: &str,
) -> Result<ClassSheet, CoreError> {
    let lines = collect_note_lines(
        conn,
        "WHERE el.classe_id = ?1 AND e.periode_id = ?2 AND el.statut = 'inscrit'",
        (classe_id, periode_id),
    )?;
    Ok(ClassSheet {
        subjects_by_student: group_subjects(lines)?,
    })
}

/// Subject averages of a single student, for bulletins of students that are
/// outside the ranked class pool (e.g. no longer enrolled).
pub fn load_student_subjects(
    conn: &Connection,
    eleve_id: &str,
    periode_id: &str,
) -> Result<Vec<SubjectAverage>, CoreError> {
    let lines = collect_note_lines(
        conn,
        "WHERE n.eleve_id = ?1 AND e.periode_id = ?2",
        (eleve_id, periode_id),
    )?;
    let mut grouped = group_subjects(lines)?;
    Ok(grouped.remove(eleve_id).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(note: f64, note_sur: f64, coeff: f64) -> GradeSample {
        GradeSample {
            note: Some(note),
            statut: NoteStatut::Present,
            note_sur,
            coefficient: coeff,
        }
    }

    #[test]
    fn normalize_scales_to_20() {
        assert_eq!(normalize_to_20(15.0, 20.0).unwrap(), 15.0);
        assert_eq!(normalize_to_20(8.0, 10.0).unwrap(), 16.0);
    }

    #[test]
    fn normalize_rejects_non_positive_scale() {
        let e = normalize_to_20(10.0, 0.0).unwrap_err();
        assert_eq!(e.code, "invalid_score");
        assert_eq!(normalize_to_20(10.0, -5.0).unwrap_err().code, "invalid_score");
    }

    #[test]
    fn subject_average_weights_by_type_coefficient() {
        // normalized 15 with coeff 2 and normalized 16 with coeff 1.
        let avg = subject_average(&[present(15.0, 20.0, 2.0), present(8.0, 10.0, 1.0)])
            .unwrap()
            .unwrap();
        assert_eq!(avg, 15.33);
    }

    #[test]
    fn subject_average_over_no_present_entry_is_none() {
        assert_eq!(subject_average(&[]).unwrap(), None);

        let absent = GradeSample {
            note: Some(12.0),
            statut: NoteStatut::Absent,
            note_sur: 20.0,
            coefficient: 1.0,
        };
        let unmarked = GradeSample {
            note: None,
            statut: NoteStatut::Present,
            note_sur: 20.0,
            coefficient: 1.0,
        };
        assert_eq!(subject_average(&[absent, unmarked]).unwrap(), None);
    }

    fn subj(nom: &str, coeff: f64, moyenne: Option<f64>) -> SubjectAverage {
        SubjectAverage {
            matiere_id: nom.to_ascii_lowercase(),
            matiere_nom: nom.to_string(),
            coefficient: coeff,
            moyenne,
        }
    }

    #[test]
    fn general_average_skips_null_subjects() {
        let subjects = [
            subj("Maths", 3.0, Some(12.0)),
            subj("Anglais", 1.0, None),
            subj("Physique", 2.0, Some(15.0)),
        ];
        // (12*3 + 15*2) / 5 = 13.2
        assert_eq!(general_average(&subjects), Some(13.2));
    }

    #[test]
    fn general_average_of_all_null_subjects_is_none() {
        let subjects = [subj("Maths", 3.0, None), subj("Anglais", 1.0, None)];
        assert_eq!(general_average(&subjects), None);
    }

    #[test]
    fn competition_ranking_shares_ranks_on_ties() {
        let pool = [18.0, 15.0, 15.0, 10.0];
        let ranks: Vec<Option<i64>> = pool
            .iter()
            .map(|&m| competition_rank(Some(m), &pool))
            .collect();
        assert_eq!(ranks, vec![Some(1), Some(2), Some(2), Some(4)]);
    }

    #[test]
    fn ranking_compares_at_two_decimals() {
        // Float noise below a centi-point must not split a tie.
        let pool = [14.55, 14.549999999999999];
        assert_eq!(competition_rank(Some(14.55), &pool), Some(1));
    }

    #[test]
    fn null_average_has_no_rank() {
        assert_eq!(competition_rank(None, &[12.0]), None);
        assert_eq!(competition_rank(Some(12.0), &[]), None);
    }
}
