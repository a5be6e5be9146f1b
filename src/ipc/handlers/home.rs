use chrono::Duration;
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use super::agenda::query_events;
use super::courses::{course_from_row, CourseRow, COURSE_SELECT};
use super::semesters::active_semesters;
use super::tasks::select_tasks;
use crate::clock::fmt_date_time;
use crate::ipc::helpers::{
    db_conn, db_err, finish, invalid, like_pattern, opt_str, params, require_user, HandlerResult,
};
use crate::ipc::types::{AppState, Request};

const DASHBOARD_DAYS: i64 = 7;
const DASHBOARD_EVENTS: i64 = 10;
const DASHBOARD_SEMESTERS: usize = 4;
const TOP_COURSES: i64 = 6;
const SEARCH_LIMIT: i64 = 10;

fn courses_where(
    conn: &Connection,
    where_sql: &str,
    binds: &[&dyn rusqlite::ToSql],
    order_sql: &str,
    limit: i64,
) -> rusqlite::Result<Vec<CourseRow>> {
    let mut stmt = conn.prepare(&format!(
        "{COURSE_SELECT} WHERE {where_sql} ORDER BY {order_sql} LIMIT {limit}"
    ))?;
    let rows = stmt
        .query_map(binds, course_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn count(conn: &Connection, sql: &str, owner_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(sql, [owner_id], |r| r.get(0))
}

fn handle_dashboard(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let now = state.clock.now();
    let today = state.clock.today();
    let q = |e: rusqlite::Error| db_err(req, "db_query_failed", e);

    let horizon = now + Duration::days(DASHBOARD_DAYS);
    let events = query_events(
        conn,
        "e.owner_id = ?1 AND e.start_at >= ?2 AND e.start_at < ?3",
        params![user.id, fmt_date_time(now), fmt_date_time(horizon)],
        "e.start_at ASC",
        DASHBOARD_EVENTS,
        0,
        now,
    )
    .map_err(q)?;

    let semesters = active_semesters(conn, &user.id).map_err(q)?;
    let semester_cards: Vec<Value> = semesters
        .iter()
        .take(DASHBOARD_SEMESTERS)
        .map(|s| s.to_json(today))
        .collect();

    let top = courses_where(
        conn,
        "s.owner_id = ?1 AND c.active = 1 AND s.active = 1",
        params![user.id],
        "c.access_count DESC, c.name COLLATE NOCASE",
        TOP_COURSES,
    )
    .map_err(q)?;

    let courses = count(
        conn,
        "SELECT COUNT(*) FROM courses c JOIN semesters s ON s.id = c.semester_id
         WHERE s.owner_id = ? AND c.active = 1",
        &user.id,
    )
    .map_err(q)?;
    let pending_tasks = count(
        conn,
        "SELECT COUNT(*) FROM tasks WHERE owner_id = ? AND status != 'DONE'",
        &user.id,
    )
    .map_err(q)?;
    let overdue_tasks: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE owner_id = ?1 AND status != 'DONE' AND deadline IS NOT NULL AND deadline < ?2",
            params![user.id, fmt_date_time(now)],
            |r| r.get(0),
        )
        .map_err(q)?;
    let materials = count(
        conn,
        "SELECT COUNT(*) FROM materials m JOIN courses c ON c.id = m.course_id
         JOIN semesters s ON s.id = c.semester_id WHERE s.owner_id = ?",
        &user.id,
    )
    .map_err(q)?;

    Ok(json!({
        "upcomingEvents": events,
        "semesters": semester_cards,
        "topCourses": top.iter().map(CourseRow::to_json).collect::<Vec<_>>(),
        "totals": {
            "semesters": semesters.len(),
            "courses": courses,
            "pendingTasks": pending_tasks,
            "overdueTasks": overdue_tasks,
            "materials": materials,
        },
    }))
}

fn handle_search(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let now = state.clock.now();
    let q = opt_str(req, params(req)?, "q")?.unwrap_or_default();
    if q.chars().count() < 2 {
        return Err(invalid(req, "q", "type at least 2 characters"));
    }
    let pattern = like_pattern(&q);
    let qerr = |e: rusqlite::Error| db_err(req, "db_query_failed", e);

    let courses = courses_where(
        conn,
        "s.owner_id = ?1 AND c.active = 1
         AND (c.name LIKE ?2 ESCAPE '\\' OR c.description LIKE ?2 ESCAPE '\\')",
        params![user.id, pattern],
        "c.name COLLATE NOCASE",
        SEARCH_LIMIT,
    )
    .map_err(qerr)?;
    let events = query_events(
        conn,
        "e.owner_id = ?1 AND e.start_at >= ?2
         AND (e.title LIKE ?3 ESCAPE '\\' OR e.description LIKE ?3 ESCAPE '\\')",
        params![user.id, fmt_date_time(now), pattern],
        "e.start_at ASC",
        SEARCH_LIMIT,
        0,
        now,
    )
    .map_err(qerr)?;
    let tasks = select_tasks(
        conn,
        "t.owner_id = ?1 AND (t.title LIKE ?2 ESCAPE '\\' OR t.description LIKE ?2 ESCAPE '\\')",
        params![user.id, pattern],
        "t.deadline IS NULL, t.deadline ASC, t.created_at DESC",
        SEARCH_LIMIT,
        0,
        now,
    )
    .map_err(qerr)?;

    let total = courses.len() + events.len() + tasks.len();
    Ok(json!({
        "query": q,
        "courses": courses.iter().map(CourseRow::to_json).collect::<Vec<_>>(),
        "events": events,
        "tasks": tasks,
        "total": total,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "home.dashboard" => handle_dashboard(state, req),
        "search" => handle_search(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
