use super::{db_conn, opt_str, required_str};
use crate::convert::FileKind;
use crate::import;
use crate::ipc::error::{core_err, err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::Path;

fn job_json(job: &import::ImportJob) -> serde_json::Value {
    serde_json::to_value(job).unwrap_or_else(|_| json!({}))
}

fn handle_import_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace) = state.workspace.as_deref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind = match opt_str(req, "kind") {
        None => None,
        Some(raw) => match FileKind::parse(&raw) {
            Some(k) => Some(k),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "kind must be one of: excel, csv, pdf, image",
                    Some(json!({ "kind": raw })),
                )
            }
        },
    };
    let classe_id = opt_str(req, "classeId");
    let requested_by = opt_str(req, "requestedBy");

    match import::submit_import(
        conn,
        &state.collaborators,
        workspace,
        Path::new(&path),
        kind,
        classe_id.as_deref(),
        requested_by.as_deref(),
    ) {
        Ok(job) => ok(&req.id, job_json(&job)),
        Err(e) => core_err(&req.id, e),
    }
}

fn handle_import_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let job_id = match required_str(req, "jobId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match import::load_job(conn, &job_id) {
        Ok(job) => ok(&req.id, job_json(&job)),
        Err(e) => core_err(&req.id, e),
    }
}

fn handle_import_commit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let job_id = match required_str(req, "jobId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match import::commit_import(conn, &job_id) {
        Ok((job, outcome)) => ok(
            &req.id,
            json!({
                "job": job_json(&job),
                "imported": outcome.imported,
                "errors": outcome.errors,
                "errorDetails": outcome.error_details,
            }),
        ),
        Err(e) => core_err(&req.id, e),
    }
}

fn handle_import_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let job_id = match required_str(req, "jobId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match import::cancel_import(conn, &job_id) {
        Ok(job) => ok(&req.id, job_json(&job)),
        Err(e) => core_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "import.submit" => Some(handle_import_submit(state, req)),
        "import.status" => Some(handle_import_status(state, req)),
        "import.commit" => Some(handle_import_commit(state, req)),
        "import.cancel" => Some(handle_import_cancel(state, req)),
        _ => None,
    }
}
