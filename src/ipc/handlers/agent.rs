use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use super::courses::{load_course, CourseRow};
use super::semesters::load_semester;
use crate::agent::{
    normalize_kind, AgentContext, CourseContext, SemesterContext, KIND_COURSE, KIND_HOME,
    KIND_SEMESTER,
};
use crate::clock::{fmt_date_time, parse_date_time};
use crate::ipc::helpers::{
    db_conn, db_err, finish, invalid, opt_str, params, require_user, HandlerResult,
};
use crate::ipc::types::{AppState, Request, SessionUser};

const MAX_QUESTION_CHARS: usize = 2000;

fn may_read(owner_id: &str, user: &SessionUser) -> bool {
    owner_id == user.id || user.staff || user.superuser
}

fn titled_times(
    conn: &Connection,
    sql: &str,
    binds: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Vec<(String, NaiveDateTime)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(binds, |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows
        .into_iter()
        .filter_map(|(t, at)| parse_date_time(&at).map(|d| (t, d)))
        .collect())
}

fn semester_context(
    conn: &Connection,
    semester_id: &str,
    now: NaiveDateTime,
) -> rusqlite::Result<SemesterContext> {
    let mut stmt = conn.prepare(
        "SELECT name FROM courses WHERE semester_id = ? AND active = 1 ORDER BY name COLLATE NOCASE",
    )?;
    let course_names = stmt
        .query_map([semester_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    let upcoming = titled_times(
        conn,
        "SELECT title, start_at FROM agenda_events
         WHERE (semester_id = ?1 OR course_id IN (SELECT id FROM courses WHERE semester_id = ?1))
           AND start_at >= ?2
         ORDER BY start_at LIMIT 3",
        params![semester_id, fmt_date_time(now)],
    )?;
    Ok(SemesterContext {
        course_names,
        upcoming,
    })
}

fn course_context(
    conn: &Connection,
    course_id: &str,
    now: NaiveDateTime,
) -> rusqlite::Result<CourseContext> {
    let mut stmt = conn.prepare(
        "SELECT title, kind FROM materials WHERE course_id = ? ORDER BY uploaded_at DESC LIMIT 5",
    )?;
    let materials = stmt
        .query_map([course_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    let mut stmt = conn.prepare(
        "SELECT title, deadline FROM tasks WHERE course_id = ? AND status != 'DONE'
         ORDER BY deadline IS NULL, deadline, created_at DESC LIMIT 3",
    )?;
    let pending_tasks = stmt
        .query_map([course_id], |r| {
            let deadline: Option<String> = r.get(1)?;
            Ok((r.get::<_, String>(0)?, deadline.as_deref().and_then(parse_date_time)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    let upcoming = titled_times(
        conn,
        "SELECT title, start_at FROM agenda_events WHERE course_id = ?1 AND start_at >= ?2
         ORDER BY start_at LIMIT 2",
        params![course_id, fmt_date_time(now)],
    )?;
    Ok(CourseContext {
        materials,
        pending_tasks,
        upcoming,
    })
}

/// Context for the scope, or the "not found" text the agent answers with.
fn build_context(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    kind: &str,
    now: NaiveDateTime,
) -> Result<Result<AgentContext, String>, Value> {
    let p = params(req)?;
    match kind {
        KIND_SEMESTER => {
            let Some(id) = opt_str(req, p, "semesterId")? else {
                return Ok(Err("Error: Semester not found.".to_string()));
            };
            let semester = load_semester(conn, &id).map_err(|e| db_err(req, "db_query_failed", e))?;
            match semester.filter(|s| may_read(&s.owner_id, user)) {
                None => Ok(Err("Error: Semester not found.".to_string())),
                Some(s) => semester_context(conn, &s.id, now)
                    .map(|c| Ok(AgentContext::Semester(c)))
                    .map_err(|e| db_err(req, "db_query_failed", e)),
            }
        }
        KIND_COURSE => {
            let by_id = opt_str(req, p, "courseId")?;
            let course: Option<CourseRow> = match (by_id, opt_str(req, p, "slug")?) {
                (Some(id), _) => load_course(conn, &id)
                    .map_err(|e| db_err(req, "db_query_failed", e))?,
                (None, Some(slug)) => {
                    let id: Option<String> = conn
                        .query_row("SELECT id FROM courses WHERE slug = ?", [&slug], |r| r.get(0))
                        .optional()
                        .map_err(|e| db_err(req, "db_query_failed", e))?;
                    match id {
                        Some(id) => load_course(conn, &id)
                            .map_err(|e| db_err(req, "db_query_failed", e))?,
                        None => None,
                    }
                }
                (None, None) => None,
            };
            match course.filter(|c| may_read(&c.owner_id, user)) {
                None => Ok(Err("Error: Course not found.".to_string())),
                Some(c) => course_context(conn, &c.id, now)
                    .map(|ctx| Ok(AgentContext::Course(ctx)))
                    .map_err(|e| db_err(req, "db_query_failed", e)),
            }
        }
        _ => Ok(Ok(AgentContext::None)),
    }
}

fn handle_ask(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let scope = opt_str(req, p, "scope")?.unwrap_or_else(|| KIND_HOME.to_string());
    let kind = normalize_kind(&scope);
    let question = opt_str(req, p, "question")?
        .ok_or_else(|| invalid(req, "question", "ask a question first"))?;
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(invalid(req, "question", "question must be at most 2000 characters"));
    }

    let ctx = {
        let conn = db_conn(state, req)?;
        build_context(conn, req, &user, kind, now)?
    };
    let (reply, found) = match ctx {
        Ok(ctx) => (state.agents.get(kind).respond(&question, &ctx, now), true),
        Err(text) => (text, false),
    };
    log::debug!("event=agent_ask kind={kind} found={found} chars={}", question.chars().count());
    Ok(json!({
        "scope": kind,
        "reply": reply,
        "found": found,
        "askedAt": fmt_date_time(now),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "agent.ask" => handle_ask(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
