mod test_support;

use serde_json::json;
use test_support::{request_ok, result_str, seed_class, spawn_sidecar, temp_dir};

#[test]
fn bulletin_generation_is_idempotent_and_tracks_grade_changes() {
    let workspace = temp_dir("bulletind-bulletin-gen");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_class(&mut stdin, &mut reader, &workspace);

    let matiere = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "registry.createSubject",
        json!({ "nom": "Mathématiques", "coefficient": 2.0 }),
    );
    let matiere_id = result_str(&matiere, "id");
    let type_eval = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "registry.createEvaluationType",
        json!({ "nom": "Devoir", "coefficient": 1.0 }),
    );
    let type_id = result_str(&type_eval, "id");
    let eleve = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "registry.createStudent",
        json!({
            "classeId": seed.classe_id,
            "nom": "Dupont",
            "prenoms": "Jean",
            "matricule": "M001"
        }),
    );
    let eleve_id = result_str(&eleve, "id");
    let evaluation = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "registry.createEvaluation",
        json!({
            "classeId": seed.classe_id,
            "matiereId": matiere_id,
            "periodeId": seed.periode_id,
            "typeEvaluationId": type_id,
            "titre": "Devoir 1",
            "noteSur": 20.0
        }),
    );
    let evaluation_id = result_str(&evaluation, "id");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.set",
        json!({ "eleveId": eleve_id, "evaluationId": evaluation_id, "note": 15.0 }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "bulletin.generate",
        json!({ "eleveId": eleve_id, "periodeId": seed.periode_id }),
    );
    assert_eq!(first.get("moyenneGenerale").and_then(|v| v.as_f64()), Some(15.0));
    assert_eq!(first.get("rangClasse").and_then(|v| v.as_i64()), Some(1));
    let bulletin_id = result_str(&first, "bulletinId");

    let download = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "bulletin.download",
        json!({ "bulletinId": bulletin_id }),
    );
    assert!(download.get("sizeBytes").and_then(|v| v.as_u64()).unwrap_or(0) > 0);

    // A second generation for the same (student, period) reuses the row.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "bulletin.generate",
        json!({ "eleveId": eleve_id, "periodeId": seed.periode_id }),
    );
    assert_eq!(result_str(&second, "bulletinId"), bulletin_id);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.set",
        json!({ "eleveId": eleve_id, "evaluationId": evaluation_id, "note": 10.0 }),
    );
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "bulletin.generate",
        json!({ "eleveId": eleve_id, "periodeId": seed.periode_id }),
    );
    assert_eq!(result_str(&third, "bulletinId"), bulletin_id);
    assert_eq!(third.get("moyenneGenerale").and_then(|v| v.as_f64()), Some(10.0));

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "bulletin.list",
        json!({ "classeId": seed.classe_id, "periodeId": seed.periode_id }),
    );
    let rows = listing
        .get("bulletins")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("moyenneGenerale").and_then(|v| v.as_f64()),
        Some(10.0)
    );
}

#[test]
fn averages_rescale_marks_and_weight_by_evaluation_type() {
    let workspace = temp_dir("bulletind-bulletin-scale");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_class(&mut stdin, &mut reader, &workspace);

    let matiere = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "registry.createSubject",
        json!({ "nom": "Physique", "coefficient": 3.0 }),
    );
    let matiere_id = result_str(&matiere, "id");
    let devoir = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "registry.createEvaluationType",
        json!({ "nom": "Devoir", "coefficient": 2.0 }),
    );
    let interro = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "registry.createEvaluationType",
        json!({ "nom": "Interrogation", "coefficient": 1.0 }),
    );
    let eleve = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "registry.createStudent",
        json!({
            "classeId": seed.classe_id,
            "nom": "Kone",
            "prenoms": "Awa",
            "matricule": "M010"
        }),
    );
    let eleve_id = result_str(&eleve, "id");

    let ev_devoir = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "registry.createEvaluation",
        json!({
            "classeId": seed.classe_id,
            "matiereId": matiere_id,
            "periodeId": seed.periode_id,
            "typeEvaluationId": result_str(&devoir, "id"),
            "titre": "Devoir 1",
            "noteSur": 20.0
        }),
    );
    let ev_interro = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "registry.createEvaluation",
        json!({
            "classeId": seed.classe_id,
            "matiereId": matiere_id,
            "periodeId": seed.periode_id,
            "typeEvaluationId": result_str(&interro, "id"),
            "titre": "Interro 1",
            "noteSur": 10.0
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.set",
        json!({ "eleveId": eleve_id, "evaluationId": result_str(&ev_devoir, "id"), "note": 12.0 }),
    );
    // 8/10 counts as 16/20 once rescaled.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.set",
        json!({ "eleveId": eleve_id, "evaluationId": result_str(&ev_interro, "id"), "note": 8.0 }),
    );

    let bulletin = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "bulletin.generate",
        json!({ "eleveId": eleve_id, "periodeId": seed.periode_id }),
    );
    // (12*2 + 16*1) / 3 = 13.33
    assert_eq!(
        bulletin.get("moyenneGenerale").and_then(|v| v.as_f64()),
        Some(13.33)
    );
}
