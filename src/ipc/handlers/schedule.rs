use chrono::NaiveTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use super::courses::{owned_course, visible_course};
use crate::calendar::weekday_name;
use crate::clock::{fmt_time, parse_time};
use crate::ipc::helpers::{
    bad_params, conflict, db_conn, db_err, finish, need_str, need_time, new_id, not_found, object,
    only_keys, opt_bool, opt_i64, opt_str, params, require_user, validation, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{course_color, duration_label, find_conflict, validate_window, SlotWindow};
use crate::validate::ValidationError;

pub struct SlotInput {
    pub weekday: u32,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub location: String,
    pub notes: String,
}

pub fn parse_slot_input(req: &Request, obj: &Map<String, Value>) -> Result<SlotInput, Value> {
    let weekday = opt_i64(req, obj, "weekday")?.ok_or_else(|| bad_params(req, "missing weekday"))?;
    let start = need_time(req, obj, "startTime")?;
    let end = need_time(req, obj, "endTime")?;
    let location = opt_str(req, obj, "location")?.unwrap_or_default();
    let notes = opt_str(req, obj, "notes")?.unwrap_or_default();
    check_window(req, weekday, start, end, &location)?;
    Ok(SlotInput {
        weekday: weekday as u32,
        start,
        end,
        location,
        notes,
    })
}

fn check_window(
    req: &Request,
    weekday: i64,
    start: NaiveTime,
    end: NaiveTime,
    location: &str,
) -> Result<(), Value> {
    let mut v = ValidationError::new();
    for (field, msg) in validate_window(weekday, start, end) {
        v.add(field, msg);
    }
    if location.chars().count() > 100 {
        v.add("location", "location must be at most 100 characters");
    }
    v.into_result().map_err(|e| validation(req, e))
}

pub fn insert_slot(
    conn: &Connection,
    course_id: &str,
    slot: &SlotInput,
) -> rusqlite::Result<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO schedule_slots(id, course_id, weekday, start_time, end_time, location, notes, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1)",
        params![
            id,
            course_id,
            slot.weekday,
            fmt_time(slot.start),
            fmt_time(slot.end),
            slot.location,
            slot.notes
        ],
    )?;
    Ok(id)
}

struct SlotRow {
    id: String,
    course_id: String,
    course_name: String,
    weekday: u32,
    start: NaiveTime,
    end: NaiveTime,
    location: String,
    notes: String,
    active: bool,
}

impl SlotRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "courseId": self.course_id,
            "courseName": self.course_name,
            "weekday": self.weekday,
            "weekdayName": weekday_name(self.weekday),
            "startTime": fmt_time(self.start),
            "endTime": fmt_time(self.end),
            "location": self.location,
            "notes": self.notes,
            "active": self.active,
            "durationLabel": duration_label(self.start, self.end),
            "color": course_color(&self.course_name),
        })
    }

    fn window(&self) -> SlotWindow {
        SlotWindow {
            id: self.id.clone(),
            weekday: self.weekday,
            start: self.start,
            end: self.end,
        }
    }
}

const SLOT_SELECT: &str = "SELECT s.id, s.course_id, c.name, s.weekday, s.start_time, s.end_time,
        s.location, s.notes, s.active
     FROM schedule_slots s JOIN courses c ON c.id = s.course_id";

fn slot_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SlotRow> {
    let start: String = r.get(4)?;
    let end: String = r.get(5)?;
    Ok(SlotRow {
        id: r.get(0)?,
        course_id: r.get(1)?,
        course_name: r.get(2)?,
        weekday: r.get::<_, i64>(3)? as u32,
        start: parse_time(&start).unwrap_or_default(),
        end: parse_time(&end).unwrap_or_default(),
        location: r.get(6)?,
        notes: r.get(7)?,
        active: r.get::<_, i64>(8)? != 0,
    })
}

fn slot_rows(
    conn: &Connection,
    course_id: &str,
    active_only: bool,
) -> rusqlite::Result<Vec<SlotRow>> {
    let filter = if active_only { " AND s.active = 1" } else { "" };
    let mut stmt = conn.prepare(&format!(
        "{SLOT_SELECT} WHERE s.course_id = ?{filter} ORDER BY s.weekday, s.start_time"
    ))?;
    let rows = stmt
        .query_map([course_id], slot_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

pub fn load_slots(
    conn: &Connection,
    course_id: &str,
    active_only: bool,
) -> rusqlite::Result<Vec<Value>> {
    Ok(slot_rows(conn, course_id, active_only)?
        .iter()
        .map(SlotRow::to_json)
        .collect())
}

fn load_slot(conn: &Connection, slot_id: &str) -> rusqlite::Result<Option<SlotRow>> {
    conn.query_row(&format!("{SLOT_SELECT} WHERE s.id = ?"), [slot_id], slot_from_row)
        .optional()
}

/// Overlap with another active slot of the same course, then the
/// (course, weekday, start) uniqueness rule.
/// Overlap against the course's other active slots. Inactive slots skip it.
fn check_against_course(
    conn: &Connection,
    req: &Request,
    course_id: &str,
    candidate: &SlotWindow,
    exclude: Option<&str>,
    active: bool,
) -> Result<(), Value> {
    if active {
        check_overlap(conn, req, course_id, candidate, exclude)?;
    }
    check_same_start(conn, req, course_id, candidate, exclude)
}

fn check_overlap(
    conn: &Connection,
    req: &Request,
    course_id: &str,
    candidate: &SlotWindow,
    exclude: Option<&str>,
) -> Result<(), Value> {
    let existing: Vec<SlotWindow> = slot_rows(conn, course_id, true)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .iter()
        .map(SlotRow::window)
        .collect();
    if let Some(other) = find_conflict(candidate, &existing, exclude) {
        return Err(conflict(
            req,
            format!(
                "overlaps the {} {} - {} slot",
                weekday_name(other.weekday),
                fmt_time(other.start),
                fmt_time(other.end)
            ),
            Some(json!({ "slotId": other.id })),
        ));
    }
    Ok(())
}

/// `(course, weekday, startTime)` is unique whether or not the slot is active.
fn check_same_start(
    conn: &Connection,
    req: &Request,
    course_id: &str,
    candidate: &SlotWindow,
    exclude: Option<&str>,
) -> Result<(), Value> {
    let same_start = conn
        .query_row(
            "SELECT id FROM schedule_slots WHERE course_id = ? AND weekday = ? AND start_time = ? AND id != ?",
            params![course_id, candidate.weekday, fmt_time(candidate.start), exclude.unwrap_or("")],
            |r| r.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    if same_start.is_some() {
        return Err(validation(
            req,
            ValidationError::single("startTime", "this course already has a slot starting then"),
        ));
    }
    Ok(())
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let course_id = need_str(req, p, "courseId")?;
    owned_course(conn, req, &user, &course_id)?;
    let slot = parse_slot_input(req, p)?;
    let candidate = SlotWindow {
        id: String::new(),
        weekday: slot.weekday,
        start: slot.start,
        end: slot.end,
    };
    check_against_course(conn, req, &course_id, &candidate, None, true)?;
    let id = insert_slot(conn, &course_id, &slot).map_err(|e| db_err(req, "db_insert_failed", e))?;
    let row = load_slot(conn, &id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "slot"))?;
    Ok(json!({ "slotId": id, "slot": row.to_json() }))
}

fn handle_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let slot_id = need_str(req, p, "slotId")?;
    let patch = object(req, p, "patch")?;
    only_keys(
        req,
        patch,
        &["weekday", "startTime", "endTime", "location", "notes", "active"],
    )?;
    let current = load_slot(conn, &slot_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "slot"))?;
    owned_course(conn, req, &user, &current.course_id)?;

    let weekday = opt_i64(req, patch, "weekday")?.unwrap_or(current.weekday as i64);
    let start = match patch.get("startTime") {
        None => current.start,
        Some(_) => need_time(req, patch, "startTime")?,
    };
    let end = match patch.get("endTime") {
        None => current.end,
        Some(_) => need_time(req, patch, "endTime")?,
    };
    let location = if patch.contains_key("location") {
        opt_str(req, patch, "location")?.unwrap_or_default()
    } else {
        current.location.clone()
    };
    let notes = if patch.contains_key("notes") {
        opt_str(req, patch, "notes")?.unwrap_or_default()
    } else {
        current.notes.clone()
    };
    let active = opt_bool(req, patch, "active")?.unwrap_or(current.active);
    check_window(req, weekday, start, end, &location)?;
    let candidate = SlotWindow {
        id: slot_id.clone(),
        weekday: weekday as u32,
        start,
        end,
    };
    check_against_course(
        conn,
        req,
        &current.course_id,
        &candidate,
        Some(&slot_id),
        active,
    )?;
    conn.execute(
        "UPDATE schedule_slots SET weekday = ?, start_time = ?, end_time = ?, location = ?, notes = ?, active = ?
         WHERE id = ?",
        params![
            weekday,
            fmt_time(start),
            fmt_time(end),
            location,
            notes,
            active as i64,
            slot_id
        ],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    let row = load_slot(conn, &slot_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "slot"))?;
    Ok(json!({ "slot": row.to_json() }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let slot_id = need_str(req, params(req)?, "slotId")?;
    let current = load_slot(conn, &slot_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "slot"))?;
    owned_course(conn, req, &user, &current.course_id)?;
    conn.execute("DELETE FROM schedule_slots WHERE id = ?", [&slot_id])
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    Ok(json!({ "deleted": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let course_id = need_str(req, p, "courseId")?;
    visible_course(conn, req, &user, &course_id)?;
    let include_inactive = opt_bool(req, p, "includeInactive")?.unwrap_or(false);
    let slots = load_slots(conn, &course_id, !include_inactive)
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({ "slots": slots }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "schedule.create" => handle_create(state, req),
        "schedule.update" => handle_update(state, req),
        "schedule.delete" => handle_delete(state, req),
        "schedule.list" => handle_list(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
