use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{finish, required_str, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "user": state.user.as_ref().map(|u| json!({
                "id": u.id,
                "username": u.username,
                "staff": u.staff,
                "superuser": u.superuser,
            })),
            "now": crate::clock::fmt_date_time(state.clock.now()),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> HandlerResult {
    let path = PathBuf::from(required_str(req, "path")?);
    match db::open_db(&path) {
        Ok(conn) => {
            if state.user.take().is_some() {
                log::info!("event=session_cleared reason=workspace_change");
            }
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            log::info!("event=workspace_open path={}", path.display());
            Ok(json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => Err(err(&req.id, "db_open_failed", format!("{e:#}"), None)),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(finish(req, handle_workspace_select(state, req))),
        _ => None,
    }
}
