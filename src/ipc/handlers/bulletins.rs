use super::{db_conn, opt_str, required_str};
use crate::archive;
use crate::bulletin;
use crate::ipc::error::{core_err, err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace) = state.workspace.as_deref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let eleve_id = match required_str(req, "eleveId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let periode_id = match required_str(req, "periodeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let requested_by = opt_str(req, "requestedBy");

    match bulletin::generate_bulletin(
        conn,
        state.renderer.as_ref(),
        workspace,
        &eleve_id,
        &periode_id,
        requested_by.as_deref(),
    ) {
        Ok(record) => ok(
            &req.id,
            serde_json::to_value(&record).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => core_err(&req.id, e),
    }
}

fn handle_generate_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace) = state.workspace.as_deref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let classe_id = match required_str(req, "classeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let periode_id = match required_str(req, "periodeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let requested_by = opt_str(req, "requestedBy");

    match bulletin::generate_for_class(
        conn,
        state.renderer.as_ref(),
        workspace,
        &classe_id,
        &periode_id,
        requested_by.as_deref(),
    ) {
        Ok(generation) => ok(
            &req.id,
            serde_json::to_value(&generation).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => core_err(&req.id, e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classe_id = match required_str(req, "classeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let periode_id = match required_str(req, "periodeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT b.id, b.eleve_id, el.nom, el.prenoms, el.matricule,
                b.moyenne_generale, b.rang_classe, b.fichier_pdf, b.genere_le
         FROM bulletins b
         JOIN eleves el ON el.id = b.eleve_id
         WHERE el.classe_id = ?1 AND b.periode_id = ?2
         ORDER BY b.rang_classe IS NULL, b.rang_classe, el.nom, el.prenoms",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "storage_failed", e.to_string(), None),
    };

    let rows = stmt.query_map([&classe_id, &periode_id], |r| {
        Ok(json!({
            "bulletinId": r.get::<_, String>(0)?,
            "eleveId": r.get::<_, String>(1)?,
            "nom": r.get::<_, String>(2)?,
            "prenoms": r.get::<_, String>(3)?,
            "matricule": r.get::<_, String>(4)?,
            "moyenneGenerale": r.get::<_, Option<f64>>(5)?,
            "rangClasse": r.get::<_, Option<i64>>(6)?,
            "fichierPdf": r.get::<_, String>(7)?,
            "genereLe": r.get::<_, String>(8)?,
        }))
    });
    let collected: Result<Vec<serde_json::Value>, _> = match rows {
        Ok(iter) => iter.collect(),
        Err(e) => return err(&req.id, "storage_failed", e.to_string(), None),
    };
    match collected {
        Ok(bulletins) => ok(&req.id, json!({ "bulletins": bulletins })),
        Err(e) => err(&req.id, "storage_failed", e.to_string(), None),
    }
}

fn handle_download(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bulletin_id = match required_str(req, "bulletinId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let path: Option<String> = match conn
        .query_row(
            "SELECT fichier_pdf FROM bulletins WHERE id = ?",
            [&bulletin_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "storage_failed", e.to_string(), None),
    };
    let Some(path) = path else {
        return err(
            &req.id,
            "not_found",
            format!("bulletin introuvable: {}", bulletin_id),
            None,
        );
    };

    match std::fs::metadata(&path) {
        Ok(meta) => ok(
            &req.id,
            json!({ "path": path, "sizeBytes": meta.len() }),
        ),
        Err(_) => err(
            &req.id,
            "not_found",
            "fichier du bulletin introuvable sur le disque",
            Some(json!({ "path": path })),
        ),
    }
}

fn handle_class_archive(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace) = state.workspace.as_deref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let classe_id = match required_str(req, "classeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let annee_id = match required_str(req, "anneeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match opt_str(req, "outPath") {
        Some(p) => PathBuf::from(p),
        None => workspace.join(format!("bulletins_{}_{}.zip", classe_id, annee_id)),
    };

    match archive::export_class_archive(conn, &classe_id, &annee_id, Path::new(&out_path)) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "path": out_path.to_string_lossy(),
                "entryCount": summary.entry_count,
            }),
        ),
        Err(e) => core_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bulletin.generate" => Some(handle_generate(state, req)),
        "bulletin.generateClass" => Some(handle_generate_class(state, req)),
        "bulletin.list" => Some(handle_list(state, req)),
        "bulletin.download" => Some(handle_download(state, req)),
        "bulletin.classArchive" => Some(handle_class_archive(state, req)),
        _ => None,
    }
}
