use chrono::{Duration, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde_json::{json, Value};

use super::courses::owned_course;
use crate::clock::{fmt_date_time, parse_date_time};
use crate::ipc::helpers::{
    db_conn, db_err, finish, forbidden, invalid, need_str, new_id, not_found, object, only_keys,
    opt_date, opt_date_time, opt_str, params, require_user, HandlerResult, Page,
};
use crate::ipc::types::{AppState, Request, SessionUser};

const PAGE_SIZE: i64 = 20;
const STATUSES: [&str; 3] = ["PENDING", "IN_PROGRESS", "DONE"];
const DEFAULT_ORDER: &str = "t.deadline IS NULL, t.deadline ASC, t.created_at DESC";

fn status_label(status: &str) -> &'static str {
    match status {
        "PENDING" => "Pending",
        "IN_PROGRESS" => "In progress",
        "DONE" => "Done",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Pending,
    Done,
    All,
}

impl StatusFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn clause(self) -> Option<&'static str> {
        match self {
            Self::Pending => Some("t.status != 'DONE'"),
            Self::Done => Some("t.status = 'DONE'"),
            Self::All => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub owner_id: Option<String>,
    pub semester_id: Option<String>,
    pub course_id: Option<String>,
    pub status: StatusFilter,
}

const TASK_SELECT: &str = "SELECT t.id, t.course_id, c.name, c.semester_id, t.title, t.description,
        t.status, t.deadline, t.created_at, t.updated_at, t.owner_id
     FROM tasks t JOIN courses c ON c.id = t.course_id";

fn task_json(r: &rusqlite::Row<'_>, now: NaiveDateTime) -> rusqlite::Result<Value> {
    let status: String = r.get(6)?;
    let deadline: Option<String> = r.get(7)?;
    let parsed = deadline.as_deref().and_then(parse_date_time);
    let overdue = status != "DONE" && parsed.is_some_and(|d| d < now);
    let days_to_deadline = parsed.map(|d| (d.date() - now.date()).num_days());
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "courseId": r.get::<_, String>(1)?,
        "courseName": r.get::<_, String>(2)?,
        "semesterId": r.get::<_, String>(3)?,
        "title": r.get::<_, String>(4)?,
        "description": r.get::<_, String>(5)?,
        "statusLabel": status_label(&status),
        "status": status,
        "deadline": deadline,
        "createdAt": r.get::<_, String>(8)?,
        "updatedAt": r.get::<_, String>(9)?,
        "ownerId": r.get::<_, String>(10)?,
        "overdue": overdue,
        "daysToDeadline": days_to_deadline,
    }))
}

/// Tasks joined with their course. `where_sql` sees aliases `t` and `c`;
/// a negative `limit` means no limit.
pub fn select_tasks(
    conn: &Connection,
    where_sql: &str,
    binds: &[&dyn ToSql],
    order_sql: &str,
    limit: i64,
    offset: i64,
    now: NaiveDateTime,
) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(&format!(
        "{TASK_SELECT} WHERE {where_sql} ORDER BY {order_sql} LIMIT {limit} OFFSET {offset}"
    ))?;
    let rows = stmt
        .query_map(binds, |r| task_json(r, now))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

/// One page of tasks plus counters over the whole filter (status aside).
pub fn query_tasks(
    conn: &Connection,
    filter: &TaskFilter,
    page: Page,
    now: NaiveDateTime,
) -> rusqlite::Result<Value> {
    let mut clauses: Vec<String> = vec!["1 = 1".into()];
    let mut binds: Vec<&dyn ToSql> = Vec::new();
    if let Some(owner) = filter.owner_id.as_ref() {
        binds.push(owner);
        clauses.push(format!("t.owner_id = ?{}", binds.len()));
    }
    if let Some(semester) = filter.semester_id.as_ref() {
        binds.push(semester);
        clauses.push(format!("c.semester_id = ?{}", binds.len()));
    }
    if let Some(course) = filter.course_id.as_ref() {
        binds.push(course);
        clauses.push(format!("t.course_id = ?{}", binds.len()));
    }
    let base_where = clauses.join(" AND ");

    let now_s = fmt_date_time(now);
    let mut stat_binds = binds.clone();
    stat_binds.push(&now_s);
    let now_idx = stat_binds.len();
    let (total, pending, done, overdue): (i64, i64, i64, i64) = conn.query_row(
        &format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(t.status != 'DONE'), 0),
                    COALESCE(SUM(t.status = 'DONE'), 0),
                    COALESCE(SUM(t.status != 'DONE' AND t.deadline IS NOT NULL AND t.deadline < ?{now_idx}), 0)
             FROM tasks t JOIN courses c ON c.id = t.course_id WHERE {base_where}"
        ),
        stat_binds.as_slice(),
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )?;

    let where_sql = match filter.status.clause() {
        Some(c) => format!("{base_where} AND {c}"),
        None => base_where,
    };
    let matching: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM tasks t JOIN courses c ON c.id = t.course_id WHERE {where_sql}"
        ),
        binds.as_slice(),
        |r| r.get(0),
    )?;
    let tasks = select_tasks(
        conn,
        &where_sql,
        &binds,
        DEFAULT_ORDER,
        page.size,
        page.offset(),
        now,
    )?;
    Ok(json!({
        "tasks": tasks,
        "pagination": page.meta(matching),
        "stats": {
            "total": total,
            "pending": pending,
            "done": done,
            "overdue": overdue,
        },
    }))
}

struct TaskRef {
    owner_id: String,
    status: String,
    title: String,
    description: String,
    deadline: Option<String>,
}

fn load_task(conn: &Connection, id: &str) -> rusqlite::Result<Option<TaskRef>> {
    conn.query_row(
        "SELECT owner_id, status, title, description, deadline FROM tasks WHERE id = ?",
        [id],
        |r| {
            Ok(TaskRef {
                owner_id: r.get(0)?,
                status: r.get(1)?,
                title: r.get(2)?,
                description: r.get(3)?,
                deadline: r.get(4)?,
            })
        },
    )
    .optional()
}

/// Owner or staff may change a task.
fn editable_task(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    id: &str,
) -> Result<TaskRef, Value> {
    let task = load_task(conn, id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "task"))?;
    if task.owner_id != user.id && !user.staff && !user.superuser {
        return Err(forbidden(req, "this task belongs to another user"));
    }
    Ok(task)
}

fn parse_status(req: &Request, raw: Option<String>, current: &str) -> Result<String, Value> {
    match raw {
        None => Ok(current.to_string()),
        Some(s) => {
            let s = s.to_ascii_uppercase();
            if STATUSES.contains(&s.as_str()) {
                Ok(s)
            } else {
                Err(invalid(req, "status", "status must be PENDING, IN_PROGRESS or DONE"))
            }
        }
    }
}

fn check_title(req: &Request, title: &str) -> Result<(), Value> {
    if title.chars().count() > 200 {
        return Err(invalid(req, "title", "title must be at most 200 characters"));
    }
    Ok(())
}

fn check_deadline(req: &Request, deadline: NaiveDateTime, now: NaiveDateTime) -> Result<(), Value> {
    if deadline < now - Duration::hours(1) {
        return Err(invalid(req, "deadline", "the deadline cannot be in the past"));
    }
    Ok(())
}

fn load_one(conn: &Connection, req: &Request, id: &str, now: NaiveDateTime) -> HandlerResult {
    select_tasks(conn, "t.id = ?1", params![id], DEFAULT_ORDER, 1, 0, now)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .into_iter()
        .next()
        .ok_or_else(|| not_found(req, "task"))
}

fn handle_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let course_id = need_str(req, p, "courseId")?;
    owned_course(conn, req, &user, &course_id)?;
    let title = opt_str(req, p, "title")?
        .ok_or_else(|| invalid(req, "title", "title is required"))?;
    check_title(req, &title)?;
    let description = opt_str(req, p, "description")?.unwrap_or_default();
    let status = parse_status(req, opt_str(req, p, "status")?, "PENDING")?;
    let deadline = match opt_date(req, p, "suggestedDate")? {
        Some(day) => Some(day.and_time(NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default())),
        None => opt_date_time(req, p, "deadline")?,
    };
    if let Some(d) = deadline {
        check_deadline(req, d, now)?;
    }

    let id = new_id();
    let now_s = fmt_date_time(now);
    conn.execute(
        "INSERT INTO tasks(id, course_id, title, description, status, deadline, created_at, updated_at, owner_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            course_id,
            title,
            description,
            status,
            deadline.map(fmt_date_time),
            now_s,
            now_s,
            user.id
        ],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    let task = load_one(conn, req, &id, now)?;
    Ok(json!({ "taskId": id, "task": task }))
}

fn handle_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let task_id = need_str(req, p, "taskId")?;
    let patch = object(req, p, "patch")?;
    only_keys(req, patch, &["title", "description", "status", "deadline"])?;
    let current = editable_task(conn, req, &user, &task_id)?;

    let title = match patch.get("title") {
        None => current.title.clone(),
        Some(_) => opt_str(req, patch, "title")?
            .ok_or_else(|| invalid(req, "title", "title is required"))?,
    };
    check_title(req, &title)?;
    let description = if patch.contains_key("description") {
        opt_str(req, patch, "description")?.unwrap_or_default()
    } else {
        current.description.clone()
    };
    let status = parse_status(req, opt_str(req, patch, "status")?, &current.status)?;
    let deadline = if patch.contains_key("deadline") {
        let d = opt_date_time(req, patch, "deadline")?;
        let changed = d.map(fmt_date_time) != current.deadline;
        if let (Some(d), true) = (d, changed) {
            check_deadline(req, d, now)?;
        }
        d.map(fmt_date_time)
    } else {
        current.deadline.clone()
    };
    conn.execute(
        "UPDATE tasks SET title = ?, description = ?, status = ?, deadline = ?, updated_at = ? WHERE id = ?",
        params![title, description, status, deadline, fmt_date_time(now), task_id],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    Ok(json!({ "task": load_one(conn, req, &task_id, now)? }))
}

fn handle_toggle(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let now = state.clock.now();
    let task_id = need_str(req, params(req)?, "taskId")?;
    let current = editable_task(conn, req, &user, &task_id)?;
    let next = if current.status == "DONE" { "PENDING" } else { "DONE" };
    conn.execute(
        "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?",
        params![next, fmt_date_time(now), task_id],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    Ok(json!({ "status": next, "task": load_one(conn, req, &task_id, now)? }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let task_id = need_str(req, params(req)?, "taskId")?;
    editable_task(conn, req, &user, &task_id)?;
    conn.execute("DELETE FROM tasks WHERE id = ?", [&task_id])
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    Ok(json!({ "deleted": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let status = match opt_str(req, p, "status")? {
        None => StatusFilter::Pending,
        Some(raw) => StatusFilter::parse(&raw)
            .ok_or_else(|| invalid(req, "status", "use pending, done or all"))?,
    };
    let filter = TaskFilter {
        owner_id: Some(user.id.clone()),
        semester_id: opt_str(req, p, "semesterId")?,
        course_id: opt_str(req, p, "courseId")?,
        status,
    };
    let page = Page::from_params(req, p, PAGE_SIZE)?;
    query_tasks(conn, &filter, page, state.clock.now())
        .map_err(|e| db_err(req, "db_query_failed", e))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "tasks.create" => handle_create(state, req),
        "tasks.update" => handle_update(state, req),
        "tasks.toggle" => handle_toggle(state, req),
        "tasks.delete" => handle_delete(state, req),
        "tasks.list" => handle_list(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
