use chrono::{Duration, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use super::courses::delete_course_rows;
use super::tasks::{query_tasks, StatusFilter, TaskFilter};
use crate::clock::{fmt_date, fmt_date_time, parse_date};
use crate::ipc::helpers::{
    db_conn, db_err, finish, forbidden, need_date, need_str, new_id, not_found,
    object, only_keys, opt_bool, opt_date, opt_i64, opt_str, params, require_user, validation,
    workspace, HandlerResult, Page,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use crate::storage;
use crate::validate::ValidationError;

const PERIODS: [&str; 4] = ["1", "2", "SUMMER", "WINTER"];
const TASKS_PAGE_SIZE: i64 = 15;

fn period_label(period: &str) -> &'static str {
    match period {
        "1" => "1st semester",
        "2" => "2nd semester",
        "SUMMER" => "Summer",
        "WINTER" => "Winter",
        _ => "Unknown",
    }
}

fn normalize_period(raw: &str) -> Option<String> {
    let up = raw.trim().to_ascii_uppercase();
    PERIODS.contains(&up.as_str()).then_some(up)
}

pub struct SemesterRow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub year: i64,
    pub period: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub active: bool,
}

impl SemesterRow {
    pub fn to_json(&self, today: NaiveDate) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "year": self.year,
            "period": self.period,
            "periodLabel": period_label(&self.period),
            "startDate": fmt_date(self.start_date),
            "endDate": fmt_date(self.end_date),
            "active": self.active,
            "isCurrent": self.active && self.start_date <= today && today <= self.end_date,
        })
    }
}

pub const SEMESTER_COLUMNS: &str =
    "id, owner_id, name, year, period, start_date, end_date, active";

pub fn semester_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SemesterRow> {
    let start: String = r.get(5)?;
    let end: String = r.get(6)?;
    Ok(SemesterRow {
        id: r.get(0)?,
        owner_id: r.get(1)?,
        name: r.get(2)?,
        year: r.get(3)?,
        period: r.get(4)?,
        start_date: parse_date(&start).unwrap_or_default(),
        end_date: parse_date(&end).unwrap_or_default(),
        active: r.get::<_, i64>(7)? != 0,
    })
}

pub fn load_semester(conn: &Connection, id: &str) -> rusqlite::Result<Option<SemesterRow>> {
    conn.query_row(
        &format!("SELECT {SEMESTER_COLUMNS} FROM semesters WHERE id = ?"),
        [id],
        semester_from_row,
    )
    .optional()
}

/// The semester, provided the caller owns it.
pub fn owned_semester(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    semester_id: &str,
) -> Result<SemesterRow, Value> {
    let row = load_semester(conn, semester_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "semester"))?;
    if row.owner_id != user.id {
        return Err(forbidden(req, "this semester belongs to another user"));
    }
    Ok(row)
}

struct SemesterInput {
    name: String,
    year: i64,
    period: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    active: bool,
}

fn check_semester(
    conn: &Connection,
    req: &Request,
    owner_id: &str,
    input: &SemesterInput,
    exclude_id: Option<&str>,
) -> Result<(), Value> {
    let mut v = ValidationError::new();
    if input.name.chars().count() > 100 {
        v.add("name", "name must be at most 100 characters");
    }
    if !(2000..=2100).contains(&input.year) {
        v.add("year", "year must be between 2000 and 2100");
    }
    if input.end_date <= input.start_date {
        v.add("endDate", "end date must be after start date");
    }
    let duplicate = conn
        .query_row(
            "SELECT id FROM semesters WHERE owner_id = ? AND year = ? AND period = ? AND id != ?",
            params![owner_id, input.year, input.period, exclude_id.unwrap_or("")],
            |r| r.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    if duplicate.is_some() {
        v.add("period", "you already have a semester for this year and period");
    }
    v.into_result().map_err(|e| validation(req, e))
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let period_raw = need_str(req, p, "period")?;
    let Some(period) = normalize_period(&period_raw) else {
        return Err(validation(
            req,
            ValidationError::single("period", "period must be one of 1, 2, SUMMER, WINTER"),
        ));
    };
    let input = SemesterInput {
        name: need_str(req, p, "name")?,
        year: opt_i64(req, p, "year")?
            .ok_or_else(|| crate::ipc::helpers::bad_params(req, "missing year"))?,
        period,
        start_date: need_date(req, p, "startDate")?,
        end_date: need_date(req, p, "endDate")?,
        active: opt_bool(req, p, "active")?.unwrap_or(true),
    };
    check_semester(conn, req, &user.id, &input, None)?;
    let id = new_id();
    conn.execute(
        "INSERT INTO semesters(id, owner_id, name, year, period, start_date, end_date, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            user.id,
            input.name,
            input.year,
            input.period,
            fmt_date(input.start_date),
            fmt_date(input.end_date),
            input.active as i64
        ],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    let row = load_semester(conn, &id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "semester"))?;
    Ok(json!({ "semesterId": id, "semester": row.to_json(state.clock.today()) }))
}

fn handle_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let semester_id = need_str(req, p, "semesterId")?;
    let patch = object(req, p, "patch")?;
    only_keys(req, patch, &["name", "year", "period", "startDate", "endDate", "active"])?;
    let current = owned_semester(conn, req, &user, &semester_id)?;

    let period = match opt_str(req, patch, "period")? {
        None => current.period.clone(),
        Some(raw) => normalize_period(&raw).ok_or_else(|| {
            validation(
                req,
                ValidationError::single("period", "period must be one of 1, 2, SUMMER, WINTER"),
            )
        })?,
    };
    let input = SemesterInput {
        name: opt_str(req, patch, "name")?.unwrap_or(current.name),
        year: opt_i64(req, patch, "year")?.unwrap_or(current.year),
        period,
        start_date: opt_date(req, patch, "startDate")?.unwrap_or(current.start_date),
        end_date: opt_date(req, patch, "endDate")?.unwrap_or(current.end_date),
        active: opt_bool(req, patch, "active")?.unwrap_or(current.active),
    };
    check_semester(conn, req, &user.id, &input, Some(&semester_id))?;
    conn.execute(
        "UPDATE semesters SET name = ?, year = ?, period = ?, start_date = ?, end_date = ?, active = ?
         WHERE id = ?",
        params![
            input.name,
            input.year,
            input.period,
            fmt_date(input.start_date),
            fmt_date(input.end_date),
            input.active as i64,
            semester_id
        ],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    let row = load_semester(conn, &semester_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "semester"))?;
    Ok(json!({ "semester": row.to_json(state.clock.today()) }))
}

pub fn active_semesters(conn: &Connection, owner_id: &str) -> rusqlite::Result<Vec<SemesterRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SEMESTER_COLUMNS} FROM semesters
         WHERE owner_id = ? AND active = 1
         ORDER BY year DESC, period DESC"
    ))?;
    let rows = stmt
        .query_map([owner_id], semester_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let today = state.clock.today();
    let rows = active_semesters(conn, &user.id).map_err(|e| db_err(req, "db_query_failed", e))?;
    let current = rows
        .iter()
        .find(|s| s.start_date <= today && today <= s.end_date)
        .map(|s| s.id.clone());
    let mut out = Vec::with_capacity(rows.len());
    for s in &rows {
        let course_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM courses WHERE semester_id = ? AND active = 1",
                [&s.id],
                |r| r.get(0),
            )
            .map_err(|e| db_err(req, "db_query_failed", e))?;
        let mut j = s.to_json(today);
        j["courseCount"] = json!(course_count);
        out.push(j);
    }
    Ok(json!({ "semesters": out, "currentSemesterId": current }))
}

fn handle_open(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let semester_id = need_str(req, params(req)?, "semesterId")?;
    let semester = owned_semester(conn, req, &user, &semester_id)?;
    let now = state.clock.now();

    let mut stmt = conn
        .prepare(
            "SELECT id, name, description, slug, access_count FROM courses
             WHERE semester_id = ? AND active = 1 ORDER BY name COLLATE NOCASE",
        )
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let courses = stmt
        .query_map([&semester_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, String>(2)?,
                "slug": r.get::<_, String>(3)?,
                "accessCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err(req, "db_query_failed", e))?;

    let horizon = now + Duration::days(30);
    let events = super::agenda::query_events(
        conn,
        "(e.semester_id = ?1 OR e.course_id IN (SELECT id FROM courses WHERE semester_id = ?1))
         AND e.start_at >= ?2 AND e.start_at <= ?3",
        params![semester_id, fmt_date_time(now), fmt_date_time(horizon)],
        "e.start_at ASC",
        10,
        0,
        now,
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;

    Ok(json!({
        "semester": semester.to_json(state.clock.today()),
        "courses": courses,
        "upcomingEvents": events,
    }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let ws = workspace(state, req)?;
    let semester_id = need_str(req, params(req)?, "semesterId")?;
    let semester = owned_semester(conn, req, &user, &semester_id)?;

    let course_ids: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT id FROM courses WHERE semester_id = ?")
            .map_err(|e| db_err(req, "db_query_failed", e))?;
        let ids = stmt
            .query_map([&semester_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| db_err(req, "db_query_failed", e))?;
        ids
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    let mut files = Vec::new();
    for course_id in &course_ids {
        files.extend(
            delete_course_rows(&tx, course_id).map_err(|e| db_err(req, "db_delete_failed", e))?,
        );
    }
    tx.execute("DELETE FROM agenda_events WHERE semester_id = ?", [&semester_id])
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    tx.execute("DELETE FROM semesters WHERE id = ?", [&semester_id])
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;

    for f in &files {
        if let Err(e) = storage::remove(ws, f) {
            log::warn!("event=material_file_remove_failed path={f} err={e}");
        }
    }
    log::info!(
        "event=semester_deleted id={} courses={} files={}",
        semester.id,
        course_ids.len(),
        files.len()
    );
    Ok(json!({ "deleted": true, "coursesDeleted": course_ids.len() }))
}

fn handle_tasks(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let semester_id = need_str(req, p, "semesterId")?;
    let semester = owned_semester(conn, req, &user, &semester_id)?;
    let status = match opt_str(req, p, "status")? {
        None => StatusFilter::All,
        Some(raw) => StatusFilter::parse(&raw).ok_or_else(|| {
            validation(req, ValidationError::single("status", "use pending, done or all"))
        })?,
    };
    let course_id = opt_str(req, p, "courseId")?;
    if let Some(cid) = course_id.as_deref() {
        let belongs = conn
            .query_row(
                "SELECT 1 FROM courses WHERE id = ? AND semester_id = ?",
                params![cid, semester_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| db_err(req, "db_query_failed", e))?;
        if belongs.is_none() {
            return Err(not_found(req, "course"));
        }
    }
    let page = Page::from_params(req, p, TASKS_PAGE_SIZE)?;
    let filter = TaskFilter {
        owner_id: Some(user.id.clone()),
        semester_id: Some(semester_id),
        course_id,
        status,
    };
    let mut out = query_tasks(conn, &filter, page, state.clock.now())
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    out["semester"] = semester.to_json(state.clock.today());
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "semesters.create" => handle_create(state, req),
        "semesters.update" => handle_update(state, req),
        "semesters.list" => handle_list(state, req),
        "semesters.open" => handle_open(state, req),
        "semesters.delete" => handle_delete(state, req),
        "semesters.tasks" => handle_tasks(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
