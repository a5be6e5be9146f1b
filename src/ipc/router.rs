use serde_json::Value;

use super::handlers;
use super::types::{AppState, Request};
use crate::audit::{self, Severity};
use crate::ipc::error::{err, error_code};

type TryHandle = fn(&mut AppState, &Request) -> Option<Value>;

const FAMILIES: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::users::try_handle,
    handlers::semesters::try_handle,
    handlers::courses::try_handle,
    handlers::schedule::try_handle,
    handlers::materials::try_handle,
    handlers::tasks::try_handle,
    handlers::agenda::try_handle,
    handlers::calendar::try_handle,
    handlers::agent::try_handle,
    handlers::audit::try_handle,
    handlers::lab::try_handle,
    handlers::google::try_handle,
    handlers::home::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> Value {
    log::debug!("event=request method={} id={}", req.method, req.id);
    let resp = FAMILIES
        .iter()
        .find_map(|family| family(state, &req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });
    if let Some(code) = error_code(&resp) {
        log::warn!(
            "event=request_failed method={} id={} code={}",
            req.method,
            req.id,
            code
        );
        audit_failure(state, &req, code, &resp);
    }
    resp
}

fn failure_severity(code: &str) -> Option<(Severity, &'static str)> {
    match code {
        "forbidden" | "not_authenticated" => Some((Severity::Security, "Access denied")),
        "io_failed" => Some((Severity::Error, "System error")),
        c if c.starts_with("db_") => Some((Severity::Error, "System error")),
        _ => None,
    }
}

fn audit_failure(state: &AppState, req: &Request, code: &str, resp: &Value) {
    let Some((severity, action_type)) = failure_severity(code) else {
        return;
    };
    let Some(conn) = state.db.as_ref() else {
        return;
    };
    let message = resp
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("");
    let author = state
        .user
        .as_ref()
        .map(|u| u.username.as_str())
        .unwrap_or("Anonymous");
    audit::record_quietly(
        conn,
        state.clock.now(),
        &audit::Entry {
            author: Some(author),
            action_type,
            description: &format!("{code}: {message}"),
            method: Some(&req.method),
            severity,
        },
    );
}
