//! Minimal persistence surface for the reference data the pipelines hang
//! off: establishments, years, periods, classes, subjects, evaluation
//! types, students, evaluations and directly keyed grade entry.

use super::{db_conn, opt_f64, opt_str, required_str};
use crate::calc::NoteStatut;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn insert_err(req: &Request, table: &str, e: rusqlite::Error) -> serde_json::Value {
    err(
        &req.id,
        "storage_failed",
        e.to_string(),
        Some(json!({ "table": table })),
    )
}

fn handle_create_establishment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nom = match required_str(req, "nom") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO etablissements(id, nom) VALUES(?, ?)",
        (&id, &nom),
    ) {
        return insert_err(req, "etablissements", e);
    }
    ok(&req.id, json!({ "id": id }))
}

fn handle_create_year(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let etablissement_id = match required_str(req, "etablissementId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let libelle = match required_str(req, "libelle") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO annees_scolaires(id, etablissement_id, libelle) VALUES(?, ?, ?)",
        (&id, &etablissement_id, &libelle),
    ) {
        return insert_err(req, "annees_scolaires", e);
    }
    ok(&req.id, json!({ "id": id }))
}

fn handle_create_period(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let annee_id = match required_str(req, "anneeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nom = match required_str(req, "nom") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ordre = req.params.get("ordre").and_then(|v| v.as_i64()).unwrap_or(0);
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO periodes(id, annee_scolaire_id, nom, ordre) VALUES(?, ?, ?, ?)",
        (&id, &annee_id, &nom, ordre),
    ) {
        return insert_err(req, "periodes", e);
    }
    ok(&req.id, json!({ "id": id }))
}

fn handle_create_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let etablissement_id = match required_str(req, "etablissementId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nom = match required_str(req, "nom") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, etablissement_id, nom) VALUES(?, ?, ?)",
        (&id, &etablissement_id, &nom),
    ) {
        return insert_err(req, "classes", e);
    }
    ok(&req.id, json!({ "id": id }))
}

fn handle_create_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nom = match required_str(req, "nom") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coefficient = opt_f64(req, "coefficient").unwrap_or(1.0);
    if coefficient <= 0.0 {
        return err(&req.id, "bad_params", "coefficient must be > 0", None);
    }
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO matieres(id, nom, coefficient) VALUES(?, ?, ?)",
        (&id, &nom, coefficient),
    ) {
        return insert_err(req, "matieres", e);
    }
    ok(&req.id, json!({ "id": id }))
}

fn handle_create_evaluation_type(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nom = match required_str(req, "nom") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coefficient = opt_f64(req, "coefficient").unwrap_or(1.0);
    if coefficient <= 0.0 {
        return err(&req.id, "bad_params", "coefficient must be > 0", None);
    }
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO types_evaluations(id, nom, coefficient) VALUES(?, ?, ?)",
        (&id, &nom, coefficient),
    ) {
        return insert_err(req, "types_evaluations", e);
    }
    ok(&req.id, json!({ "id": id }))
}

fn handle_create_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classe_id = match required_str(req, "classeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nom = match required_str(req, "nom") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let prenoms = match required_str(req, "prenoms") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let matricule = match required_str(req, "matricule") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sexe = opt_str(req, "sexe");
    let date_naissance = opt_str(req, "dateNaissance");
    let statut = opt_str(req, "statut").unwrap_or_else(|| "inscrit".to_string());
    if statut != "inscrit" && statut != "parti" {
        return err(&req.id, "bad_params", "statut must be inscrit or parti", None);
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO eleves(id, classe_id, nom, prenoms, sexe, matricule, statut, date_naissance)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &classe_id,
            &nom,
            &prenoms,
            sexe,
            &matricule,
            &statut,
            date_naissance,
        ),
    ) {
        return insert_err(req, "eleves", e);
    }
    ok(&req.id, json!({ "id": id, "matricule": matricule }))
}

fn handle_create_evaluation(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classe_id = match required_str(req, "classeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let matiere_id = match required_str(req, "matiereId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let periode_id = match required_str(req, "periodeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let type_evaluation_id = match required_str(req, "typeEvaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let titre = match required_str(req, "titre") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let note_sur = opt_f64(req, "noteSur").unwrap_or(20.0);
    if note_sur <= 0.0 {
        return err(
            &req.id,
            "invalid_score",
            "noteSur must be > 0",
            Some(json!({ "noteSur": note_sur })),
        );
    }
    let date_evaluation = opt_str(req, "dateEvaluation");

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO evaluations(id, classe_id, matiere_id, periode_id, type_evaluation_id,
                                 titre, note_sur, date_evaluation)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &classe_id,
            &matiere_id,
            &periode_id,
            &type_evaluation_id,
            &titre,
            note_sur,
            date_evaluation,
        ),
    ) {
        return insert_err(req, "evaluations", e);
    }
    ok(&req.id, json!({ "id": id }))
}

fn handle_grades_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let eleve_id = match required_str(req, "eleveId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let statut_raw = opt_str(req, "statut").unwrap_or_else(|| "present".to_string());
    let Some(statut) = NoteStatut::parse(&statut_raw) else {
        return err(
            &req.id,
            "bad_params",
            "statut must be one of: present, absent, exempte",
            Some(json!({ "statut": statut_raw })),
        );
    };
    let note = opt_f64(req, "note");
    if let Some(v) = note {
        if v < 0.0 {
            return err(
                &req.id,
                "bad_params",
                "negative notes are not allowed",
                Some(json!({ "note": v })),
            );
        }
    }
    let commentaire = opt_str(req, "commentaire");
    let saisie_par = opt_str(req, "saisiePar");

    let note_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO notes(id, eleve_id, evaluation_id, note, statut, commentaire, saisie_par)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(eleve_id, evaluation_id) DO UPDATE SET
           note = excluded.note,
           statut = excluded.statut,
           commentaire = excluded.commentaire,
           saisie_par = excluded.saisie_par",
        (
            &note_id,
            &eleve_id,
            &evaluation_id,
            note,
            statut.as_str(),
            commentaire,
            saisie_par,
        ),
    ) {
        return insert_err(req, "notes", e);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "registry.createEstablishment" => Some(handle_create_establishment(state, req)),
        "registry.createYear" => Some(handle_create_year(state, req)),
        "registry.createPeriod" => Some(handle_create_period(state, req)),
        "registry.createClass" => Some(handle_create_class(state, req)),
        "registry.createSubject" => Some(handle_create_subject(state, req)),
        "registry.createEvaluationType" => Some(handle_create_evaluation_type(state, req)),
        "registry.createStudent" => Some(handle_create_student(state, req)),
        "registry.createEvaluation" => Some(handle_create_evaluation(state, req)),
        "grades.set" => Some(handle_grades_set(state, req)),
        _ => None,
    }
}
