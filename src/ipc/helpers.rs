//! Parameter parsing and guard helpers shared by every handler family.
//! Each returns a ready-to-send error envelope on failure so handlers can
//! use `?` throughout.

use std::fmt::Display;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::clock::{parse_date, parse_date_time, parse_time};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, SessionUser};
use crate::validate::ValidationError;

pub type HandlerResult = Result<Value, Value>;

pub fn finish(req: &Request, result: HandlerResult) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e,
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn workspace<'a>(state: &'a AppState, req: &Request) -> Result<&'a Path, Value> {
    state
        .workspace
        .as_deref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// No workspace means no users table, so `no_workspace` wins over
/// `not_authenticated`.
pub fn require_user(state: &AppState, req: &Request) -> Result<SessionUser, Value> {
    db_conn(state, req)?;
    state
        .user
        .clone()
        .ok_or_else(|| err(&req.id, "not_authenticated", "log in first", None))
}

pub fn require_staff(state: &AppState, req: &Request) -> Result<SessionUser, Value> {
    let user = require_user(state, req)?;
    if !user.staff && !user.superuser {
        return Err(forbidden(req, "staff only"));
    }
    Ok(user)
}

pub fn require_superuser(state: &AppState, req: &Request) -> Result<SessionUser, Value> {
    let user = require_user(state, req)?;
    if !user.superuser {
        return Err(forbidden(req, "superuser only"));
    }
    Ok(user)
}

pub fn bad_params(req: &Request, message: impl Into<String>) -> Value {
    err(&req.id, "bad_params", message, None)
}

pub fn forbidden(req: &Request, message: impl Into<String>) -> Value {
    err(&req.id, "forbidden", message, None)
}

pub fn not_found(req: &Request, what: &str) -> Value {
    err(&req.id, "not_found", format!("{what} not found"), None)
}

pub fn conflict(req: &Request, message: impl Into<String>, details: Option<Value>) -> Value {
    err(&req.id, "conflict", message, details)
}

pub fn db_err(req: &Request, code: &str, e: impl Display) -> Value {
    err(&req.id, code, e.to_string(), None)
}

pub fn validation(req: &Request, e: ValidationError) -> Value {
    let message = e.to_string();
    err(
        &req.id,
        "validation_failed",
        message,
        Some(json!({ "fields": e.fields })),
    )
}

pub fn invalid(req: &Request, field: &str, message: impl Into<String>) -> Value {
    validation(req, ValidationError::single(field, message))
}

/// Params as an object; `{}` when absent.
pub fn params(req: &Request) -> Result<&Map<String, Value>, Value> {
    static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
    match &req.params {
        Value::Null => Ok(EMPTY.get_or_init(Map::new)),
        Value::Object(m) => Ok(m),
        _ => Err(bad_params(req, "params must be an object")),
    }
}

pub fn object<'a>(
    req: &Request,
    src: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a Map<String, Value>, Value> {
    src.get(key)
        .and_then(|v| v.as_object())
        .ok_or_else(|| bad_params(req, format!("{key} must be an object")))
}

/// Trimmed string; `None` when absent, null or blank.
pub fn opt_str(
    req: &Request,
    src: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, Value> {
    match src.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok(if s.is_empty() { None } else { Some(s.to_string()) })
        }
        Some(_) => Err(bad_params(req, format!("{key} must be a string"))),
    }
}

pub fn need_str(req: &Request, src: &Map<String, Value>, key: &str) -> Result<String, Value> {
    opt_str(req, src, key)?.ok_or_else(|| bad_params(req, format!("missing {key}")))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    need_str(req, params(req)?, key)
}

pub fn opt_i64(req: &Request, src: &Map<String, Value>, key: &str) -> Result<Option<i64>, Value> {
    match src.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| bad_params(req, format!("{key} must be an integer"))),
    }
}

pub fn opt_bool(req: &Request, src: &Map<String, Value>, key: &str) -> Result<Option<bool>, Value> {
    match src.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| bad_params(req, format!("{key} must be a boolean"))),
    }
}

pub fn string_array(
    req: &Request,
    src: &Map<String, Value>,
    key: &str,
) -> Result<Vec<String>, Value> {
    match src.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| bad_params(req, format!("{key} must be an array of strings")))?
                    .trim()
                    .to_string();
                if !s.is_empty() && !out.contains(&s) {
                    out.push(s);
                }
            }
            Ok(out)
        }
        Some(_) => Err(bad_params(req, format!("{key} must be an array of strings"))),
    }
}

pub fn opt_date(
    req: &Request,
    src: &Map<String, Value>,
    key: &str,
) -> Result<Option<NaiveDate>, Value> {
    match opt_str(req, src, key)? {
        None => Ok(None),
        Some(raw) => parse_date(&raw)
            .map(Some)
            .ok_or_else(|| invalid(req, key, "enter a valid date (YYYY-MM-DD)")),
    }
}

pub fn need_date(req: &Request, src: &Map<String, Value>, key: &str) -> Result<NaiveDate, Value> {
    opt_date(req, src, key)?.ok_or_else(|| bad_params(req, format!("missing {key}")))
}

pub fn opt_date_time(
    req: &Request,
    src: &Map<String, Value>,
    key: &str,
) -> Result<Option<NaiveDateTime>, Value> {
    match opt_str(req, src, key)? {
        None => Ok(None),
        Some(raw) => parse_date_time(&raw)
            .map(Some)
            .ok_or_else(|| invalid(req, key, "enter a valid date and time (YYYY-MM-DDTHH:MM)")),
    }
}

pub fn need_date_time(
    req: &Request,
    src: &Map<String, Value>,
    key: &str,
) -> Result<NaiveDateTime, Value> {
    opt_date_time(req, src, key)?.ok_or_else(|| bad_params(req, format!("missing {key}")))
}

pub fn opt_time(
    req: &Request,
    src: &Map<String, Value>,
    key: &str,
) -> Result<Option<NaiveTime>, Value> {
    match opt_str(req, src, key)? {
        None => Ok(None),
        Some(raw) => parse_time(&raw)
            .map(Some)
            .ok_or_else(|| invalid(req, key, "enter a valid time (HH:MM)")),
    }
}

pub fn need_time(req: &Request, src: &Map<String, Value>, key: &str) -> Result<NaiveTime, Value> {
    opt_time(req, src, key)?.ok_or_else(|| bad_params(req, format!("missing {key}")))
}

/// Rejects keys outside `allowed`, the way setup patches do.
pub fn only_keys(req: &Request, src: &Map<String, Value>, allowed: &[&str]) -> Result<(), Value> {
    match src.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(k) => Err(bad_params(req, format!("unknown field: {k}"))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub number: i64,
    pub size: i64,
}

impl Page {
    pub fn from_params(req: &Request, src: &Map<String, Value>, size: i64) -> Result<Self, Value> {
        // Past this the offset would overflow; such pages are empty anyway.
        let number = opt_i64(req, src, "page")?
            .unwrap_or(1)
            .clamp(1, i64::MAX / size);
        Ok(Self { number, size })
    }

    pub fn offset(&self) -> i64 {
        (self.number - 1) * self.size
    }

    pub fn meta(&self, total: i64) -> Value {
        let pages = if total == 0 { 1 } else { (total + self.size - 1) / self.size };
        json!({
            "page": self.number,
            "pageSize": self.size,
            "total": total,
            "totalPages": pages,
            "hasPrev": self.number > 1,
            "hasNext": self.number < pages,
        })
    }
}

pub fn like_pattern(raw: &str) -> String {
    let escaped = raw
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}
