use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde_json::{json, Map, Value};

use super::courses::owned_course;
use super::semesters::owned_semester;
use crate::clock::{fmt_date_time, parse_date_time};
use crate::ipc::helpers::{
    db_conn, db_err, finish, forbidden, invalid, need_date_time, need_str, new_id, not_found,
    object, only_keys, opt_date_time, opt_str, params, require_user, validation, HandlerResult,
    Page,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use crate::validate::ValidationError;

const PAGE_SIZE: i64 = 20;
const SCOPES: [&str; 3] = ["GENERAL", "SEMESTER", "COURSE"];
const KINDS: [&str; 5] = ["CLASS", "EXAM", "ASSIGNMENT", "ACTIVITY", "OTHER"];

fn kind_label(kind: &str) -> &'static str {
    match kind {
        "CLASS" => "Class",
        "EXAM" => "Exam",
        "ASSIGNMENT" => "Assignment",
        "ACTIVITY" => "Activity",
        _ => "Other",
    }
}

const EVENT_SELECT: &str = "SELECT e.id, e.title, e.description, e.scope, e.kind, e.start_at, e.end_at,
        e.semester_id, sm.name, e.course_id, c.name, e.owner_id, e.created_at
     FROM agenda_events e
     LEFT JOIN semesters sm ON sm.id = e.semester_id
     LEFT JOIN courses c ON c.id = e.course_id";

fn event_json(r: &rusqlite::Row<'_>, now: NaiveDateTime) -> rusqlite::Result<Value> {
    let start: String = r.get(5)?;
    let kind: String = r.get(4)?;
    let parsed = parse_date_time(&start);
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "description": r.get::<_, String>(2)?,
        "scope": r.get::<_, String>(3)?,
        "kindLabel": kind_label(&kind),
        "kind": kind,
        "start": start,
        "end": r.get::<_, Option<String>>(6)?,
        "semesterId": r.get::<_, Option<String>>(7)?,
        "semesterName": r.get::<_, Option<String>>(8)?,
        "courseId": r.get::<_, Option<String>>(9)?,
        "courseName": r.get::<_, Option<String>>(10)?,
        "ownerId": r.get::<_, String>(11)?,
        "createdAt": r.get::<_, String>(12)?,
        "isToday": parsed.is_some_and(|d| d.date() == now.date()),
        "isFuture": parsed.is_some_and(|d| d > now),
    }))
}

/// Agenda events with semester and course names. `where_sql` sees alias
/// `e`; a negative `limit` means no limit.
pub fn query_events(
    conn: &Connection,
    where_sql: &str,
    binds: &[&dyn ToSql],
    order_sql: &str,
    limit: i64,
    offset: i64,
    now: NaiveDateTime,
) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(&format!(
        "{EVENT_SELECT} WHERE {where_sql} ORDER BY {order_sql} LIMIT {limit} OFFSET {offset}"
    ))?;
    let rows = stmt
        .query_map(binds, |r| event_json(r, now))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

struct EventRef {
    owner_id: String,
    title: String,
    description: String,
    scope: String,
    kind: String,
    start: NaiveDateTime,
    end: Option<NaiveDateTime>,
    semester_id: Option<String>,
    course_id: Option<String>,
}

fn load_event(conn: &Connection, id: &str) -> rusqlite::Result<Option<EventRef>> {
    conn.query_row(
        "SELECT owner_id, title, description, scope, kind, start_at, end_at, semester_id, course_id
         FROM agenda_events WHERE id = ?",
        [id],
        |r| {
            let start: String = r.get(5)?;
            let end: Option<String> = r.get(6)?;
            Ok(EventRef {
                owner_id: r.get(0)?,
                title: r.get(1)?,
                description: r.get(2)?,
                scope: r.get(3)?,
                kind: r.get(4)?,
                start: parse_date_time(&start).unwrap_or_default(),
                end: end.as_deref().and_then(parse_date_time),
                semester_id: r.get(7)?,
                course_id: r.get(8)?,
            })
        },
    )
    .optional()
}

fn editable_event(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    id: &str,
) -> Result<EventRef, Value> {
    let ev = load_event(conn, id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "event"))?;
    if ev.owner_id != user.id && !user.staff && !user.superuser {
        return Err(forbidden(req, "this event belongs to another user"));
    }
    Ok(ev)
}

struct EventInput {
    title: String,
    description: String,
    scope: String,
    kind: String,
    start: NaiveDateTime,
    end: Option<NaiveDateTime>,
    semester_id: Option<String>,
    course_id: Option<String>,
}

fn upper_choice(
    req: &Request,
    src: &Map<String, Value>,
    key: &str,
    allowed: &[&str],
    fallback: &str,
) -> Result<String, Value> {
    match opt_str(req, src, key)? {
        None => Ok(fallback.to_string()),
        Some(raw) => {
            let v = raw.to_ascii_uppercase();
            if allowed.contains(&v.as_str()) {
                Ok(v)
            } else {
                Err(invalid(req, key, format!("{key} must be one of {}", allowed.join(", "))))
            }
        }
    }
}

/// Scope links and ordering rules; resolves the semester of course events.
fn check_event(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    input: &mut EventInput,
) -> Result<(), Value> {
    let mut v = ValidationError::new();
    if input.title.chars().count() > 200 {
        v.add("title", "title must be at most 200 characters");
    }
    if let Some(end) = input.end {
        if end <= input.start {
            v.add("end", "the end must be after the start");
        }
    }
    match input.scope.as_str() {
        "SEMESTER" if input.semester_id.is_none() => {
            v.add("semesterId", "semester events need a semester")
        }
        "COURSE" if input.course_id.is_none() => v.add("courseId", "course events need a course"),
        _ => {}
    }
    v.into_result().map_err(|e| validation(req, e))?;

    if let Some(cid) = input.course_id.as_deref() {
        let course = owned_course(conn, req, user, cid)?;
        if input.scope == "COURSE" {
            input.semester_id = Some(course.semester_id);
        }
    }
    if let Some(sid) = input.semester_id.as_deref() {
        owned_semester(conn, req, user, sid)?;
    }
    Ok(())
}

fn load_one(conn: &Connection, req: &Request, id: &str, now: NaiveDateTime) -> HandlerResult {
    query_events(conn, "e.id = ?1", params![id], "e.start_at", 1, 0, now)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .into_iter()
        .next()
        .ok_or_else(|| not_found(req, "event"))
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let mut input = EventInput {
        title: opt_str(req, p, "title")?.ok_or_else(|| invalid(req, "title", "title is required"))?,
        description: opt_str(req, p, "description")?.unwrap_or_default(),
        scope: upper_choice(req, p, "scope", &SCOPES, "GENERAL")?,
        kind: upper_choice(req, p, "kind", &KINDS, "OTHER")?,
        start: need_date_time(req, p, "start")?,
        end: opt_date_time(req, p, "end")?,
        semester_id: opt_str(req, p, "semesterId")?,
        course_id: opt_str(req, p, "courseId")?,
    };
    if input.start < now {
        return Err(invalid(req, "start", "new events cannot start in the past"));
    }
    check_event(conn, req, &user, &mut input)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO agenda_events(id, title, description, scope, kind, start_at, end_at, semester_id, course_id, owner_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            input.title,
            input.description,
            input.scope,
            input.kind,
            fmt_date_time(input.start),
            input.end.map(fmt_date_time),
            input.semester_id,
            input.course_id,
            user.id,
            fmt_date_time(now)
        ],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    Ok(json!({ "eventId": id, "event": load_one(conn, req, &id, now)? }))
}

fn handle_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let event_id = need_str(req, p, "eventId")?;
    let patch = object(req, p, "patch")?;
    only_keys(
        req,
        patch,
        &["title", "description", "scope", "kind", "start", "end", "semesterId", "courseId"],
    )?;
    let current = editable_event(conn, req, &user, &event_id)?;

    let mut input = EventInput {
        title: match patch.get("title") {
            None => current.title.clone(),
            Some(_) => opt_str(req, patch, "title")?
                .ok_or_else(|| invalid(req, "title", "title is required"))?,
        },
        description: if patch.contains_key("description") {
            opt_str(req, patch, "description")?.unwrap_or_default()
        } else {
            current.description.clone()
        },
        scope: upper_choice(req, patch, "scope", &SCOPES, &current.scope)?,
        kind: upper_choice(req, patch, "kind", &KINDS, &current.kind)?,
        start: match patch.get("start") {
            None => current.start,
            Some(_) => need_date_time(req, patch, "start")?,
        },
        end: if patch.contains_key("end") {
            opt_date_time(req, patch, "end")?
        } else {
            current.end
        },
        semester_id: if patch.contains_key("semesterId") {
            opt_str(req, patch, "semesterId")?
        } else {
            current.semester_id.clone()
        },
        course_id: if patch.contains_key("courseId") {
            opt_str(req, patch, "courseId")?
        } else {
            current.course_id.clone()
        },
    };
    if input.scope == "GENERAL" {
        input.semester_id = None;
        input.course_id = None;
    }
    check_event(conn, req, &user, &mut input)?;
    conn.execute(
        "UPDATE agenda_events SET title = ?, description = ?, scope = ?, kind = ?, start_at = ?, end_at = ?,
             semester_id = ?, course_id = ?
         WHERE id = ?",
        params![
            input.title,
            input.description,
            input.scope,
            input.kind,
            fmt_date_time(input.start),
            input.end.map(fmt_date_time),
            input.semester_id,
            input.course_id,
            event_id
        ],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    Ok(json!({ "event": load_one(conn, req, &event_id, now)? }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let event_id = need_str(req, params(req)?, "eventId")?;
    editable_event(conn, req, &user, &event_id)?;
    conn.execute("DELETE FROM agenda_events WHERE id = ?", [&event_id])
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    Ok(json!({ "deleted": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let now_s = fmt_date_time(now);
    let page = Page::from_params(req, p, PAGE_SIZE)?;

    let mut clauses: Vec<String> = vec!["e.owner_id = ?1".into()];
    let mut binds: Vec<&dyn ToSql> = Vec::new();
    binds.push(&user.id);
    let order = match opt_str(req, p, "period")?.as_deref() {
        None | Some("upcoming") => {
            binds.push(&now_s);
            clauses.push(format!("e.start_at >= ?{}", binds.len()));
            "e.start_at ASC"
        }
        Some("past") => {
            binds.push(&now_s);
            clauses.push(format!("e.start_at < ?{}", binds.len()));
            "e.start_at DESC"
        }
        Some("all") => "e.start_at DESC",
        Some(_) => return Err(invalid(req, "period", "use upcoming, past or all")),
    };
    let kind = match opt_str(req, p, "kind")? {
        None => None,
        Some(_) => Some(upper_choice(req, p, "kind", &KINDS, "OTHER")?),
    };
    if let Some(k) = kind.as_ref() {
        binds.push(k);
        clauses.push(format!("e.kind = ?{}", binds.len()));
    }
    let where_sql = clauses.join(" AND ");

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM agenda_events e WHERE {where_sql}"),
            binds.as_slice(),
            |r| r.get(0),
        )
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let events = query_events(conn, &where_sql, &binds, order, page.size, page.offset(), now)
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let important = query_events(
        conn,
        "e.owner_id = ?1 AND e.start_at >= ?2 AND e.kind IN ('EXAM', 'ASSIGNMENT')",
        params![user.id, now_s],
        "e.start_at ASC",
        5,
        0,
        now,
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({
        "events": events,
        "pagination": page.meta(total),
        "importantUpcoming": important,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "agenda.create" => handle_create(state, req),
        "agenda.update" => handle_update(state, req),
        "agenda.delete" => handle_delete(state, req),
        "agenda.list" => handle_list(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
