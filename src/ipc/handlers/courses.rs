use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::{json, Value};

use super::schedule::{insert_slot, load_slots, parse_slot_input, SlotInput};
use super::semesters::owned_semester;
use crate::accounts::slugify;
use crate::calendar::upcoming_dates_on_weekdays;
use crate::clock::{fmt_date, fmt_date_time};
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, finish, forbidden, like_pattern, need_str, new_id,
    not_found, object, only_keys, opt_bool, opt_i64, opt_str, params, require_user, validation,
    workspace, HandlerResult, Page,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use crate::schedule::{find_conflict, SlotWindow};
use crate::storage;
use crate::validate::ValidationError;

const PAGE_SIZE: i64 = 12;

pub struct CourseRow {
    pub id: String,
    pub semester_id: String,
    pub semester_name: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub slug: String,
    pub access_count: i64,
    pub active: bool,
    pub created_at: String,
}

impl CourseRow {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "semesterId": self.semester_id,
            "semesterName": self.semester_name,
            "name": self.name,
            "description": self.description,
            "slug": self.slug,
            "accessCount": self.access_count,
            "active": self.active,
            "createdAt": self.created_at,
            "color": crate::schedule::course_color(&self.name),
        })
    }
}

pub const COURSE_SELECT: &str = "SELECT c.id, c.semester_id, s.name, s.owner_id, c.name, c.description,
        c.slug, c.access_count, c.active, c.created_at
     FROM courses c JOIN semesters s ON s.id = c.semester_id";

pub fn course_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CourseRow> {
    Ok(CourseRow {
        id: r.get(0)?,
        semester_id: r.get(1)?,
        semester_name: r.get(2)?,
        owner_id: r.get(3)?,
        name: r.get(4)?,
        description: r.get(5)?,
        slug: r.get(6)?,
        access_count: r.get(7)?,
        active: r.get::<_, i64>(8)? != 0,
        created_at: r.get(9)?,
    })
}

pub fn load_course(conn: &Connection, id: &str) -> rusqlite::Result<Option<CourseRow>> {
    conn.query_row(
        &format!("{COURSE_SELECT} WHERE c.id = ?"),
        [id],
        course_from_row,
    )
    .optional()
}

fn load_course_by_slug(conn: &Connection, slug: &str) -> rusqlite::Result<Option<CourseRow>> {
    conn.query_row(
        &format!("{COURSE_SELECT} WHERE c.slug = ?"),
        [slug],
        course_from_row,
    )
    .optional()
}

/// Course the caller may change: they own its semester.
pub fn owned_course(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    course_id: &str,
) -> Result<CourseRow, Value> {
    let row = load_course(conn, course_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "course"))?;
    if row.owner_id != user.id {
        return Err(forbidden(req, "this course belongs to another user"));
    }
    Ok(row)
}

/// Course the caller may read: owner or staff.
pub fn visible_course(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    course_id: &str,
) -> Result<CourseRow, Value> {
    let row = load_course(conn, course_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "course"))?;
    if row.owner_id != user.id && !user.staff && !user.superuser {
        return Err(forbidden(req, "this course belongs to another user"));
    }
    Ok(row)
}

fn name_taken(
    conn: &Connection,
    semester_id: &str,
    name: &str,
    exclude_id: Option<&str>,
) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT id, name FROM courses WHERE semester_id = ?")?;
    let rows = stmt
        .query_map([semester_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    let wanted = name.trim().to_lowercase();
    Ok(rows
        .iter()
        .any(|(id, n)| Some(id.as_str()) != exclude_id && n.trim().to_lowercase() == wanted))
}

/// Slug of `name`, suffixed `-1`, `-2`... until unused.
fn unique_slug(conn: &Connection, name: &str) -> rusqlite::Result<String> {
    let base = match slugify(name) {
        s if s.is_empty() => "course".to_string(),
        s => s,
    };
    let exists = |candidate: &str| -> rusqlite::Result<bool> {
        conn.query_row("SELECT 1 FROM courses WHERE slug = ?", [candidate], |_| Ok(()))
            .optional()
            .map(|v| v.is_some())
    };
    if !exists(&base)? {
        return Ok(base);
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}-{n}");
        if !exists(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

fn check_name(req: &Request, name: &str) -> Result<(), Value> {
    if name.chars().count() > 200 {
        return Err(validation(
            req,
            ValidationError::single("name", "name must be at most 200 characters"),
        ));
    }
    Ok(())
}

/// Inline slots must not clash with each other; all-or-nothing.
fn parse_inline_slots(req: &Request, raw: Option<&Value>) -> Result<Vec<SlotInput>, Value> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let items = raw
        .as_array()
        .ok_or_else(|| bad_params(req, "slots must be an array"))?;
    let mut out: Vec<SlotInput> = Vec::with_capacity(items.len());
    let mut windows: Vec<SlotWindow> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let obj = item
            .as_object()
            .ok_or_else(|| bad_params(req, format!("slots[{i}] must be an object")))?;
        let slot = parse_slot_input(req, obj)?;
        let window = SlotWindow {
            id: format!("inline-{i}"),
            weekday: slot.weekday,
            start: slot.start,
            end: slot.end,
        };
        if let Some(other) = find_conflict(&window, &windows, None) {
            return Err(validation(
                req,
                ValidationError::single(
                    &format!("slots[{i}]"),
                    format!("overlaps {}", other.id.replace("inline-", "slots[") + "]"),
                ),
            ));
        }
        windows.push(window);
        out.push(slot);
    }
    Ok(out)
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let semester_id = need_str(req, p, "semesterId")?;
    let semester = owned_semester(conn, req, &user, &semester_id)?;
    let name = need_str(req, p, "name")?;
    check_name(req, &name)?;
    let description = opt_str(req, p, "description")?.unwrap_or_default();
    let slots = parse_inline_slots(req, p.get("slots"))?;

    if name_taken(conn, &semester_id, &name, None).map_err(|e| db_err(req, "db_query_failed", e))? {
        return Err(validation(
            req,
            ValidationError::single(
                "name",
                "a course with this name already exists in this semester",
            ),
        ));
    }
    let slug = unique_slug(conn, &name).map_err(|e| db_err(req, "db_query_failed", e))?;
    let id = new_id();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO courses(id, semester_id, name, description, slug, access_count, active, created_at)
         VALUES(?, ?, ?, ?, ?, 0, 1, ?)",
        params![id, semester.id, name, description, slug, fmt_date_time(state.clock.now())],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    let mut slot_ids = Vec::with_capacity(slots.len());
    for slot in &slots {
        slot_ids.push(insert_slot(&tx, &id, slot).map_err(|e| db_err(req, "db_insert_failed", e))?);
    }
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;

    let row = load_course(conn, &id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "course"))?;
    Ok(json!({ "courseId": id, "course": row.to_json(), "slotIds": slot_ids }))
}

fn handle_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let course_id = need_str(req, p, "courseId")?;
    let patch = object(req, p, "patch")?;
    only_keys(req, patch, &["name", "description", "active"])?;
    let current = owned_course(conn, req, &user, &course_id)?;

    let name = match patch.get("name") {
        None => current.name.clone(),
        Some(_) => need_str(req, patch, "name")?,
    };
    check_name(req, &name)?;
    if name_taken(conn, &current.semester_id, &name, Some(&course_id))
        .map_err(|e| db_err(req, "db_query_failed", e))?
    {
        return Err(validation(
            req,
            ValidationError::single(
                "name",
                "a course with this name already exists in this semester",
            ),
        ));
    }
    let description = if patch.contains_key("description") {
        opt_str(req, patch, "description")?.unwrap_or_default()
    } else {
        current.description.clone()
    };
    let active = opt_bool(req, patch, "active")?.unwrap_or(current.active);
    conn.execute(
        "UPDATE courses SET name = ?, description = ?, active = ? WHERE id = ?",
        params![name, description, active as i64, course_id],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    let row = load_course(conn, &course_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "course"))?;
    Ok(json!({ "course": row.to_json() }))
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let page = Page::from_params(req, p, PAGE_SIZE)?;

    let mut clauses = vec!["c.active = 1".to_string(), "s.owner_id = ?".to_string()];
    let mut binds: Vec<SqlValue> = vec![user.id.clone().into()];
    if let Some(q) = opt_str(req, p, "search")? {
        clauses.push(
            "(c.name LIKE ? ESCAPE '\\' OR c.description LIKE ? ESCAPE '\\' OR s.name LIKE ? ESCAPE '\\')"
                .to_string(),
        );
        let pat = like_pattern(&q);
        binds.extend([pat.clone().into(), pat.clone().into(), pat.into()]);
    }
    if let Some(sid) = opt_str(req, p, "semesterId")? {
        clauses.push("c.semester_id = ?".to_string());
        binds.push(sid.into());
    }
    let order = match opt_str(req, p, "order")?.as_deref() {
        None | Some("name") => "c.name COLLATE NOCASE ASC",
        Some("accesses") => "c.access_count DESC, c.name COLLATE NOCASE ASC",
        Some("recent") => "c.created_at DESC, c.name COLLATE NOCASE ASC",
        Some(other) => {
            return Err(validation(
                req,
                ValidationError::single(
                    "order",
                    format!("unknown order {other}; use name, accesses or recent"),
                ),
            ))
        }
    };
    let where_sql = clauses.join(" AND ");

    let total: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM courses c JOIN semesters s ON s.id = c.semester_id
                 WHERE {where_sql}"
            ),
            params_from_iter(binds.iter()),
            |r| r.get(0),
        )
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let mut page_binds = binds.clone();
    page_binds.push(page.size.into());
    page_binds.push(page.offset().into());
    let mut stmt = conn
        .prepare(&format!("{COURSE_SELECT} WHERE {where_sql} ORDER BY {order} LIMIT ? OFFSET ?"))
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let rows = stmt
        .query_map(params_from_iter(page_binds.iter()), course_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({
        "courses": rows.iter().map(CourseRow::to_json).collect::<Vec<_>>(),
        "pagination": page.meta(total),
    }))
}

fn handle_open(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let course = match (opt_str(req, p, "courseId")?, opt_str(req, p, "slug")?) {
        (Some(id), _) => visible_course(conn, req, &user, &id)?,
        (None, Some(slug)) => {
            let row = load_course_by_slug(conn, &slug)
                .map_err(|e| db_err(req, "db_query_failed", e))?
                .ok_or_else(|| not_found(req, "course"))?;
            visible_course(conn, req, &user, &row.id)?
        }
        (None, None) => return Err(bad_params(req, "missing courseId or slug")),
    };

    conn.execute(
        "UPDATE courses SET access_count = access_count + 1 WHERE id = ?",
        [&course.id],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    conn.execute(
        "INSERT INTO course_accesses(id, course_id, user_id, accessed_at) VALUES(?, ?, ?, ?)",
        params![new_id(), course.id, user.id, fmt_date_time(now)],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;

    let materials = super::materials::select_materials(
        conn,
        "m.course_id = ?1",
        params![course.id],
        -1,
        0,
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    let upcoming = super::agenda::query_events(
        conn,
        "e.course_id = ?1 AND e.start_at >= ?2",
        params![course.id, fmt_date_time(now)],
        "e.start_at ASC",
        5,
        0,
        now,
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    let pending = super::tasks::select_tasks(
        conn,
        "t.course_id = ?1 AND t.status != 'DONE'",
        params![course.id],
        "t.deadline IS NULL, t.deadline ASC, t.created_at DESC",
        -1,
        0,
        now,
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    let done = super::tasks::select_tasks(
        conn,
        "t.course_id = ?1 AND t.status = 'DONE'",
        params![course.id],
        "t.updated_at DESC",
        5,
        0,
        now,
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    let slots = load_slots(conn, &course.id, true).map_err(|e| db_err(req, "db_query_failed", e))?;

    let mut body = course.to_json();
    body["accessCount"] = json!(course.access_count + 1);
    Ok(json!({
        "course": body,
        "materials": materials,
        "upcomingEvents": upcoming,
        "pendingTasks": pending,
        "recentlyCompleted": done,
        "slots": slots,
    }))
}

/// Deletes a course and everything hanging off it inside the caller's
/// transaction. Returns stored material paths for the caller to unlink
/// after commit.
pub fn delete_course_rows(conn: &Connection, course_id: &str) -> rusqlite::Result<Vec<String>> {
    let files: Vec<String> = {
        let mut stmt = conn.prepare("SELECT stored_path FROM materials WHERE course_id = ?")?;
        let rows = stmt
            .query_map([course_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        rows
    };
    conn.execute("DELETE FROM course_accesses WHERE course_id = ?", [course_id])?;
    conn.execute("DELETE FROM schedule_slots WHERE course_id = ?", [course_id])?;
    conn.execute("DELETE FROM materials WHERE course_id = ?", [course_id])?;
    conn.execute("DELETE FROM tasks WHERE course_id = ?", [course_id])?;
    conn.execute("DELETE FROM agenda_events WHERE course_id = ?", [course_id])?;
    conn.execute(
        "UPDATE calendar_events SET course_id = NULL WHERE course_id = ?",
        [course_id],
    )?;
    conn.execute("DELETE FROM courses WHERE id = ?", [course_id])?;
    Ok(files)
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let ws = workspace(state, req)?;
    let course_id = need_str(req, params(req)?, "courseId")?;
    let course = owned_course(conn, req, &user, &course_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    let files = delete_course_rows(&tx, &course_id)
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;
    for f in &files {
        if let Err(e) = storage::remove(ws, f) {
            log::warn!("event=material_file_remove_failed path={f} err={e}");
        }
    }
    log::info!("event=course_deleted id={} slug={}", course.id, course.slug);
    Ok(json!({ "deleted": true }))
}

/// Next class dates of a course, from today, scanning 60 days.
pub fn upcoming_class_dates(
    conn: &Connection,
    course_id: &str,
    today: chrono::NaiveDate,
    limit: usize,
) -> rusqlite::Result<Vec<chrono::NaiveDate>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT weekday FROM schedule_slots WHERE course_id = ? AND active = 1",
    )?;
    let weekdays = stmt
        .query_map([course_id], |r| r.get::<_, i64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    let weekdays: Vec<u32> = weekdays.into_iter().map(|d| d as u32).collect();
    Ok(upcoming_dates_on_weekdays(today, &weekdays, limit))
}

fn handle_upcoming_class_dates(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let course_id = need_str(req, p, "courseId")?;
    visible_course(conn, req, &user, &course_id)?;
    let limit = opt_i64(req, p, "limit")?.unwrap_or(5);
    if !(1..=60).contains(&limit) {
        return Err(validation(req, ValidationError::single("limit", "limit must be 1 to 60")));
    }
    let dates = upcoming_class_dates(conn, &course_id, state.clock.today(), limit as usize)
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({
        "dates": dates.iter().map(|d| json!({
            "date": fmt_date(*d),
            "weekday": crate::calendar::weekday_name(chrono::Datelike::weekday(d).num_days_from_monday()),
            "label": d.format("%d/%m/%Y").to_string(),
        })).collect::<Vec<_>>()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.create" => handle_create(state, req),
        "courses.update" => handle_update(state, req),
        "courses.list" => handle_list(state, req),
        "courses.open" => handle_open(state, req),
        "courses.delete" => handle_delete(state, req),
        "courses.upcomingClassDates" => handle_upcoming_class_dates(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
