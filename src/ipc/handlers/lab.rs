use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use super::users::user_email;
use crate::audit::{self, Severity};
use crate::calendar::{
    duration_hours, month_bounds, month_name_pt, month_weeks, normalize_month, weekday_name,
};
use crate::clock::{fmt_date, fmt_date_time, fmt_time, parse_date_time, parse_time};
use crate::ipc::error::err;
use crate::ipc::helpers::{
    conflict, db_conn, db_err, finish, invalid, need_date, need_date_time, need_str, new_id,
    not_found, opt_bool, opt_i64, opt_str, opt_time, params, require_staff,
    string_array, validation, HandlerResult,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use crate::lab::{
    compose, conflicts, contact_from_description, event_kind_label, is_event_kind,
    reject_reason_text, Booking, NotificationKind, OpeningHours, VisitRequest, EVENT_KINDS,
    REJECT_REASONS,
};
use crate::validate::{is_email, ValidationError};

struct LabEvent {
    id: String,
    title: String,
    description: String,
    start: NaiveDateTime,
    end: NaiveDateTime,
    kind: String,
    created_by: Option<String>,
    creator: Option<String>,
    approved: bool,
    created_at: String,
}

impl LabEvent {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "start": fmt_date_time(self.start),
            "end": fmt_date_time(self.end),
            "kind": self.kind,
            "kindLabel": event_kind_label(&self.kind),
            "approved": self.approved,
            "createdBy": self.created_by,
            "createdByName": self.creator,
            "createdAt": self.created_at,
            "durationHours": duration_hours(self.start, self.end),
        })
    }

    /// Requester address: the one typed into a visit form, else the creator's.
    fn contact(&self, conn: &Connection) -> rusqlite::Result<Option<String>> {
        if let Some(email) = contact_from_description(&self.description) {
            return Ok(Some(email));
        }
        match self.created_by.as_deref() {
            Some(uid) => user_email(conn, uid),
            None => Ok(None),
        }
    }
}

const EVENT_SELECT: &str = "SELECT e.id, e.title, e.description, e.start_at, e.end_at, e.kind,
        e.created_by, u.username, e.approved, e.created_at
     FROM lab_events e LEFT JOIN users u ON u.id = e.created_by";

fn event_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<LabEvent> {
    let start: String = r.get(3)?;
    let end: String = r.get(4)?;
    Ok(LabEvent {
        id: r.get(0)?,
        title: r.get(1)?,
        description: r.get(2)?,
        start: parse_date_time(&start).unwrap_or_default(),
        end: parse_date_time(&end).unwrap_or_default(),
        kind: r.get(5)?,
        created_by: r.get(6)?,
        creator: r.get(7)?,
        approved: r.get::<_, i64>(8)? != 0,
        created_at: r.get(9)?,
    })
}

fn load_event(conn: &Connection, req: &Request, id: &str) -> Result<LabEvent, Value> {
    conn.query_row(&format!("{EVENT_SELECT} WHERE e.id = ?"), [id], event_from_row)
        .optional()
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "lab event"))
}

fn events_where(
    conn: &Connection,
    where_sql: &str,
    binds: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Vec<LabEvent>> {
    let mut stmt = conn.prepare(&format!(
        "{EVENT_SELECT} WHERE {where_sql} ORDER BY e.start_at, e.title"
    ))?;
    let rows = stmt
        .query_map(binds, event_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn load_hours(conn: &Connection) -> rusqlite::Result<Vec<OpeningHours>> {
    let mut stmt = conn.prepare(
        "SELECT weekday, opening_time, closing_time, closed FROM lab_hours ORDER BY weekday",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let opening: Option<String> = r.get(1)?;
            let closing: Option<String> = r.get(2)?;
            Ok(OpeningHours {
                weekday: r.get::<_, i64>(0)? as u32,
                opening: opening.as_deref().and_then(parse_time),
                closing: closing.as_deref().and_then(parse_time),
                closed: r.get::<_, i64>(3)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn hours_json(h: &OpeningHours) -> Value {
    json!({
        "weekday": h.weekday,
        "weekdayName": weekday_name(h.weekday),
        "opening": h.opening.map(fmt_time),
        "closing": h.closing.map(fmt_time),
        "closed": h.closed,
        "label": h.label(),
    })
}

/// Every event, approved or pending, overlapping `[start, end)`.
fn bookings(
    conn: &Connection,
    start: NaiveDateTime,
    end: NaiveDateTime,
    exclude: Option<&str>,
) -> rusqlite::Result<Vec<Booking>> {
    let events = events_where(
        conn,
        "e.start_at < ?1 AND e.end_at > ?2 AND e.id != ?3",
        params![fmt_date_time(end), fmt_date_time(start), exclude.unwrap_or("")],
    )?;
    Ok(events
        .into_iter()
        .map(|e| Booking {
            id: e.id,
            title: e.title,
            start: e.start,
            end: e.end,
            approved: e.approved,
        })
        .collect())
}

fn availability(
    conn: &Connection,
    req: &Request,
    start: NaiveDateTime,
    end: NaiveDateTime,
    exclude: Option<&str>,
) -> Result<Value, Value> {
    let hours = load_hours(conn).map_err(|e| db_err(req, "db_query_failed", e))?;
    let booked = bookings(conn, start, end, exclude)
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    serde_json::to_value(conflicts(start, end, &hours, &booked))
        .map_err(|e| err(&req.id, "internal", e.to_string(), None))
}

fn queue_notification(
    conn: &Connection,
    kind: NotificationKind,
    recipient: &str,
    event: &LabEvent,
    reason: Option<&str>,
    now: NaiveDateTime,
) -> rusqlite::Result<()> {
    let msg = compose(kind, &event.title, event.start, event.end, reason);
    conn.execute(
        "INSERT INTO notifications(id, kind, recipient, subject, body, event_id, created_at, sent)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0)",
        params![
            new_id(),
            kind.as_str(),
            recipient,
            msg.subject,
            msg.body,
            event.id,
            fmt_date_time(now)
        ],
    )?;
    log::info!(
        "event=notification_queued kind={} event_id={} to={recipient}",
        kind.as_str(),
        event.id
    );
    Ok(())
}

/// Queues a message to the event's contact, when one is known.
fn notify_contact(
    conn: &Connection,
    req: &Request,
    kind: NotificationKind,
    event: &LabEvent,
    reason: Option<&str>,
    now: NaiveDateTime,
) -> Result<bool, Value> {
    let Some(to) = event.contact(conn).map_err(|e| db_err(req, "db_query_failed", e))? else {
        log::warn!(
            "event=notification_skipped kind={} event_id={} reason=no_contact",
            kind.as_str(),
            event.id
        );
        return Ok(false);
    };
    queue_notification(conn, kind, &to, event, reason, now)
        .map_err(|e| db_err(req, "db_insert_failed", e))?;
    Ok(true)
}

fn record(
    conn: &Connection,
    req: &Request,
    user: Option<&SessionUser>,
    now: NaiveDateTime,
    action_type: &str,
    description: &str,
) {
    audit::record_quietly(
        conn,
        now,
        &audit::Entry {
            author: Some(user.map(|u| u.username.as_str()).unwrap_or("Anonymous")),
            action_type,
            description,
            method: Some(&req.method),
            severity: Severity::Info,
        },
    );
}

fn participants(conn: &Connection, event_id: &str) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.first_name, u.last_name
         FROM lab_event_participants p JOIN users u ON u.id = p.user_id
         WHERE p.event_id = ? ORDER BY u.username",
    )?;
    let rows = stmt
        .query_map([event_id], |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "name": format!("{first} {last}").trim().to_string(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn replace_participants(
    conn: &Connection,
    event_id: &str,
    user_ids: &[String],
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM lab_event_participants WHERE event_id = ?", [event_id])?;
    for uid in user_ids {
        conn.execute(
            "INSERT INTO lab_event_participants(event_id, user_id) VALUES(?, ?)",
            params![event_id, uid],
        )?;
    }
    Ok(())
}

fn unknown_users(conn: &Connection, user_ids: &[String]) -> rusqlite::Result<Vec<String>> {
    let mut missing = Vec::new();
    for uid in user_ids {
        let found = conn
            .query_row("SELECT 1 FROM users WHERE id = ?", [uid], |_| Ok(()))
            .optional()?;
        if found.is_none() {
            missing.push(uid.clone());
        }
    }
    Ok(missing)
}

fn delete_event_rows(conn: &Connection, event_id: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM lab_event_participants WHERE event_id = ?", [event_id])?;
    conn.execute("DELETE FROM lab_events WHERE id = ?", [event_id])?;
    Ok(())
}

fn handle_hours_set(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let weekday = opt_i64(req, p, "weekday")?
        .ok_or_else(|| invalid(req, "weekday", "weekday is required"))?;
    if !(0..=6).contains(&weekday) {
        return Err(invalid(req, "weekday", "weekday must be 0 (Monday) to 6 (Sunday)"));
    }
    let closed = opt_bool(req, p, "closed")?.unwrap_or(false);
    let opening = opt_time(req, p, "opening")?;
    let closing = opt_time(req, p, "closing")?;
    if !closed {
        let mut v = ValidationError::new();
        match (opening, closing) {
            (Some(o), Some(c)) if c <= o => v.add("closing", "closing must be after opening"),
            (Some(_), Some(_)) => {}
            (o, c) => {
                if o.is_none() {
                    v.add("opening", "opening time is required unless closed");
                }
                if c.is_none() {
                    v.add("closing", "closing time is required unless closed");
                }
            }
        }
        v.into_result().map_err(|e| validation(req, e))?;
    }
    let (opening, closing) = if closed { (None, None) } else { (opening, closing) };
    conn.execute(
        "INSERT INTO lab_hours(weekday, opening_time, closing_time, closed) VALUES(?, ?, ?, ?)
         ON CONFLICT(weekday) DO UPDATE SET opening_time = excluded.opening_time,
             closing_time = excluded.closing_time, closed = excluded.closed",
        params![weekday, opening.map(fmt_time), closing.map(fmt_time), closed as i64],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    let hours = OpeningHours {
        weekday: weekday as u32,
        opening,
        closing,
        closed,
    };
    record(
        conn,
        req,
        Some(&user),
        state.clock.now(),
        "Opening hours",
        &format!("Opening hours set to {}", hours.label()),
    );
    Ok(json!({ "hours": hours_json(&hours) }))
}

fn handle_hours_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let saved = load_hours(conn).map_err(|e| db_err(req, "db_query_failed", e))?;
    let hours: Vec<Value> = (0..7u32)
        .map(|wd| match saved.iter().find(|h| h.weekday == wd) {
            Some(h) => {
                let mut v = hours_json(h);
                v["configured"] = json!(true);
                v
            }
            None => json!({
                "weekday": wd,
                "weekdayName": weekday_name(wd),
                "opening": null,
                "closing": null,
                "closed": false,
                "label": format!("{}: not configured", weekday_name(wd)),
                "configured": false,
            }),
        })
        .collect();
    Ok(json!({ "hours": hours }))
}

fn check_span(
    req: &Request,
    start: NaiveDateTime,
    end: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<(), Value> {
    let mut v = ValidationError::new();
    if end <= start {
        v.add("end", "the end must be after the start");
    }
    if start < now {
        v.add("start", "events cannot be scheduled in the past");
    }
    v.into_result().map_err(|e| validation(req, e))
}

fn handle_events_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let title = opt_str(req, p, "title")?
        .ok_or_else(|| invalid(req, "title", "title is required"))?;
    let description = opt_str(req, p, "description")?.unwrap_or_default();
    let start = need_date_time(req, p, "start")?;
    let end = need_date_time(req, p, "end")?;
    let kind = opt_str(req, p, "kind")?
        .map(|k| k.to_ascii_lowercase())
        .unwrap_or_else(|| "internal".to_string());
    if !is_event_kind(&kind) {
        return Err(invalid(req, "kind", format!("kind must be one of {}", EVENT_KINDS.join(", "))));
    }
    check_span(req, start, end, now)?;
    let user_ids = string_array(req, p, "participantIds")?;
    let missing = unknown_users(conn, &user_ids).map_err(|e| db_err(req, "db_query_failed", e))?;
    if !missing.is_empty() {
        return Err(invalid(
            req,
            "participantIds",
            format!("unknown users: {}", missing.join(", ")),
        ));
    }
    let found_conflicts = availability(conn, req, start, end, None)?;

    let id = new_id();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO lab_events(id, title, description, start_at, end_at, kind, created_by, approved, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        params![
            id,
            title,
            description,
            fmt_date_time(start),
            fmt_date_time(end),
            kind,
            user.id,
            fmt_date_time(now)
        ],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    replace_participants(&tx, &id, &user_ids).map_err(|e| db_err(req, "db_insert_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;

    let event = load_event(conn, req, &id)?;
    record(
        conn,
        req,
        Some(&user),
        now,
        "Lab event",
        &format!("Created lab event \"{}\"", event.title),
    );
    Ok(json!({ "eventId": id, "event": event.to_json(), "conflicts": found_conflicts }))
}

fn handle_visit_request(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let user = state.user.clone();
    let p = params(req)?;
    let now = state.clock.now();

    let mut v = ValidationError::new();
    let visitor_name = opt_str(req, p, "visitorName")?.unwrap_or_default();
    if visitor_name.is_empty() {
        v.add("visitorName", "your name is required");
    }
    let visitor_email = opt_str(req, p, "visitorEmail")?.unwrap_or_default();
    if !is_email(&visitor_email) {
        v.add("visitorEmail", "enter a valid email address");
    }
    let visitor_phone = opt_str(req, p, "visitorPhone")?.unwrap_or_default();
    if visitor_phone.is_empty() {
        v.add("visitorPhone", "a phone number is required");
    }
    let visitors = opt_i64(req, p, "visitors")?.unwrap_or(0);
    if visitors < 1 {
        v.add("visitors", "at least one visitor");
    }
    let date = need_date(req, p, "visitDate")?;
    let start_time = opt_time(req, p, "startHour")?
        .ok_or_else(|| invalid(req, "startHour", "start time is required"))?;
    let end_time = opt_time(req, p, "endHour")?
        .ok_or_else(|| invalid(req, "endHour", "end time is required"))?;
    if end_time <= start_time {
        v.add("endHour", "the end must be after the start");
    }
    let start = date.and_time(start_time);
    if start < now {
        v.add("visitDate", "visits cannot be scheduled in the past");
    }
    v.into_result().map_err(|e| validation(req, e))?;

    let end = date.and_time(end_time);
    let details = opt_str(req, p, "description")?.unwrap_or_default();
    let title = opt_str(req, p, "title")?.unwrap_or_else(|| format!("Visit - {visitor_name}"));
    let visit = VisitRequest {
        visitor_name,
        visitor_email: visitor_email.clone(),
        visitor_phone,
        visitors,
        date,
        start: start_time,
        end: end_time,
        details,
    };
    let found_conflicts = availability(conn, req, start, end, None)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO lab_events(id, title, description, start_at, end_at, kind, created_by, approved, created_at)
         VALUES(?, ?, ?, ?, ?, 'visit', ?, 0, ?)",
        params![
            id,
            title,
            visit.description(),
            fmt_date_time(start),
            fmt_date_time(end),
            user.as_ref().map(|u| u.id.clone()),
            fmt_date_time(now)
        ],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    let event = load_event(conn, req, &id)?;
    queue_notification(conn, NotificationKind::VisitSubmitted, &visitor_email, &event, None, now)
        .map_err(|e| db_err(req, "db_insert_failed", e))?;
    record(
        conn,
        req,
        user.as_ref(),
        now,
        "Visit request",
        &format!("Visit requested by {} for {}", visit.visitor_name, fmt_date(date)),
    );
    Ok(json!({ "eventId": id, "event": event.to_json(), "conflicts": found_conflicts }))
}

fn handle_availability(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let start = need_date_time(req, p, "start")?;
    let end = need_date_time(req, p, "end")?;
    if end <= start {
        return Err(invalid(req, "end", "the end must be after the start"));
    }
    let exclude = opt_str(req, p, "excludeEventId")?;
    let found = availability(conn, req, start, end, exclude.as_deref())?;
    let available = found.as_array().is_some_and(|a| a.is_empty());
    Ok(json!({ "available": available, "conflicts": found }))
}

fn handle_approve(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let now = state.clock.now();
    let event_id = need_str(req, params(req)?, "eventId")?;
    let mut event = load_event(conn, req, &event_id)?;
    if event.approved {
        return Err(conflict(req, "this event is already approved", None));
    }
    conn.execute("UPDATE lab_events SET approved = 1 WHERE id = ?", [&event_id])
        .map_err(|e| db_err(req, "db_update_failed", e))?;
    event.approved = true;
    let notified = notify_contact(conn, req, NotificationKind::VisitApproved, &event, None, now)?;
    record(
        conn,
        req,
        Some(&user),
        now,
        "Approval",
        &format!("Approved lab event \"{}\"", event.title),
    );
    Ok(json!({ "event": event.to_json(), "notified": notified }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let now = state.clock.now();
    let event_id = need_str(req, params(req)?, "eventId")?;
    let event = load_event(conn, req, &event_id)?;
    if !event.approved {
        return Err(conflict(
            req,
            "pending requests must be rejected, not deleted",
            Some(json!({ "requiresReject": true })),
        ));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    delete_event_rows(&tx, &event_id).map_err(|e| db_err(req, "db_delete_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;
    record(
        conn,
        req,
        Some(&user),
        now,
        "Deletion",
        &format!("Deleted lab event \"{}\"", event.title),
    );
    Ok(json!({ "deleted": true }))
}

fn handle_reject(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let event_id = need_str(req, p, "eventId")?;
    let event = load_event(conn, req, &event_id)?;
    if event.approved {
        return Err(conflict(req, "approved events cannot be rejected", None));
    }
    let code = opt_str(req, p, "reasonCode")?;
    if let Some(c) = code.as_deref() {
        if reject_reason_text(c).is_none() {
            let known: Vec<&str> = REJECT_REASONS.iter().map(|(c, _)| *c).collect();
            return Err(invalid(req, "reasonCode", format!("use one of {}", known.join(", "))));
        }
    }
    let reason = match opt_str(req, p, "reason")? {
        Some(r) => r,
        None => code
            .as_deref()
            .and_then(reject_reason_text)
            .filter(|_| code.as_deref() != Some("other"))
            .map(str::to_string)
            .ok_or_else(|| invalid(req, "reason", "a reason is required"))?,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    let notified = notify_contact(
        &tx,
        req,
        NotificationKind::VisitRejected,
        &event,
        Some(&reason),
        now,
    )?;
    delete_event_rows(&tx, &event_id).map_err(|e| db_err(req, "db_delete_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;
    record(
        conn,
        req,
        Some(&user),
        now,
        "Rejection",
        &format!("Rejected \"{}\": {reason}", event.title),
    );
    Ok(json!({ "rejected": true, "reason": reason, "notified": notified }))
}

fn handle_pending(state: &mut AppState, req: &Request) -> HandlerResult {
    require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let pending = events_where(conn, "e.approved = 0", &[])
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let (visits, others): (Vec<&LabEvent>, Vec<&LabEvent>) =
        pending.iter().partition(|e| e.kind == "visit");
    Ok(json!({
        "visitRequests": visits.iter().map(|e| e.to_json()).collect::<Vec<_>>(),
        "otherEvents": others.iter().map(|e| e.to_json()).collect::<Vec<_>>(),
        "total": pending.len(),
    }))
}

fn handle_open(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let staff = state.user.as_ref().is_some_and(|u| u.staff || u.superuser);
    let event_id = need_str(req, params(req)?, "eventId")?;
    let event = load_event(conn, req, &event_id)?;
    if !event.approved && !staff {
        return Err(not_found(req, "lab event"));
    }
    let people = participants(conn, &event_id).map_err(|e| db_err(req, "db_query_failed", e))?;
    let mut body = event.to_json();
    body["participants"] = Value::Array(people);
    Ok(json!({ "event": body }))
}

fn handle_participants_set(state: &mut AppState, req: &Request) -> HandlerResult {
    require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let event_id = need_str(req, p, "eventId")?;
    load_event(conn, req, &event_id)?;
    let user_ids = string_array(req, p, "userIds")?;
    let missing = unknown_users(conn, &user_ids).map_err(|e| db_err(req, "db_query_failed", e))?;
    if !missing.is_empty() {
        return Err(invalid(req, "userIds", format!("unknown users: {}", missing.join(", "))));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    replace_participants(&tx, &event_id, &user_ids)
        .map_err(|e| db_err(req, "db_update_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;
    let people = participants(conn, &event_id).map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({ "participants": people }))
}

fn google_items(
    conn: &Connection,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> rusqlite::Result<Vec<(NaiveDateTime, Value)>> {
    let mut stmt = conn.prepare(
        "SELECT google_id, summary, description, start_at, end_at, all_day FROM google_events
         WHERE start_at < ?1 AND end_at >= ?2 ORDER BY start_at",
    )?;
    let rows = stmt
        .query_map(params![fmt_date_time(to), fmt_date_time(from)], |r| {
            let start: String = r.get(3)?;
            let gid: String = r.get(0)?;
            Ok((
                parse_date_time(&start),
                json!({
                    "id": format!("google_{gid}"),
                    "title": r.get::<_, String>(1)?,
                    "description": r.get::<_, String>(2)?,
                    "start": start,
                    "end": r.get::<_, String>(4)?,
                    "kind": "google",
                    "kindLabel": event_kind_label("google"),
                    "allDay": r.get::<_, i64>(5)? != 0,
                    "source": "google",
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows
        .into_iter()
        .filter_map(|(start, v)| start.map(|s| (s, v)))
        .collect())
}

fn handle_agenda(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let today = state.clock.today();
    let (staff, superuser) = state
        .user
        .as_ref()
        .map_or((false, false), |u| (u.staff || u.superuser, u.superuser));

    let year = opt_i64(req, p, "year")?.unwrap_or(today.year() as i64);
    if !(1900..=2200).contains(&year) {
        return Err(invalid(req, "year", "year out of range"));
    }
    let month = opt_i64(req, p, "month")?.unwrap_or(today.month() as i64);
    let (year, month) = normalize_month(year as i32, month.clamp(-1, 14) as i32);
    let (first, last) = month_bounds(year, month)
        .ok_or_else(|| invalid(req, "month", "invalid month"))?;
    let from = first.and_time(NaiveTime::MIN);
    let to = last.and_time(NaiveTime::MIN) + Duration::days(1);

    let approved = events_where(
        conn,
        "e.approved = 1 AND e.start_at < ?1 AND e.end_at > ?2",
        params![fmt_date_time(to), fmt_date_time(from)],
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    let mut items: Vec<(NaiveDateTime, Value)> = approved
        .iter()
        .map(|e| {
            let mut v = e.to_json();
            v["source"] = json!("lab");
            (e.start, v)
        })
        .collect();
    if superuser {
        items.extend(google_items(conn, from, to).map_err(|e| db_err(req, "db_query_failed", e))?);
    }
    items.sort_by(|a, b| a.0.cmp(&b.0));

    let mut by_day: BTreeMap<u32, Vec<Value>> = BTreeMap::new();
    for (start, v) in &items {
        if start.date() >= first && start.date() <= last {
            by_day.entry(start.day()).or_default().push(v.clone());
        }
    }
    let mut events_by_day = Map::new();
    for (day, list) in by_day {
        events_by_day.insert(day.to_string(), Value::Array(list));
    }
    let hours = load_hours(conn).map_err(|e| db_err(req, "db_query_failed", e))?;
    let pending_count: Option<i64> = if staff {
        Some(
            conn.query_row("SELECT COUNT(*) FROM lab_events WHERE approved = 0", [], |r| r.get(0))
                .map_err(|e| db_err(req, "db_query_failed", e))?,
        )
    } else {
        None
    };
    Ok(json!({
        "year": year,
        "month": month,
        "monthName": month_name_pt(month),
        "weeks": month_weeks(year, month),
        "events": items.into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
        "eventsByDay": events_by_day,
        "openingHours": hours.iter().map(hours_json).collect::<Vec<_>>(),
        "pendingCount": pending_count,
        "today": fmt_date(today),
    }))
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> HandlerResult {
    require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let filter = match opt_str(req, params(req)?, "status")?.as_deref() {
        None | Some("all") => "1 = 1",
        Some("pending") => "sent = 0",
        Some("sent") => "sent = 1",
        Some(_) => return Err(invalid(req, "status", "use pending, sent or all")),
    };
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, kind, recipient, subject, body, event_id, created_at, sent
             FROM notifications WHERE {filter} ORDER BY created_at DESC, id"
        ))
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "to": r.get::<_, String>(2)?,
                "subject": r.get::<_, String>(3)?,
                "body": r.get::<_, String>(4)?,
                "eventId": r.get::<_, Option<String>>(5)?,
                "createdAt": r.get::<_, String>(6)?,
                "sent": r.get::<_, i64>(7)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({ "notifications": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "lab.hours.set" => handle_hours_set(state, req),
        "lab.hours.list" => handle_hours_list(state, req),
        "lab.events.create" => handle_events_create(state, req),
        "lab.events.approve" => handle_approve(state, req),
        "lab.events.delete" => handle_delete(state, req),
        "lab.events.reject" => handle_reject(state, req),
        "lab.events.pending" => handle_pending(state, req),
        "lab.events.open" => handle_open(state, req),
        "lab.events.participants.set" => handle_participants_set(state, req),
        "lab.visits.request" => handle_visit_request(state, req),
        "lab.availability" => handle_availability(state, req),
        "lab.agenda" => handle_agenda(state, req),
        "lab.notifications.list" => handle_notifications_list(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        parse_date_time(s).expect("dt")
    }

    #[test]
    fn bookings_skip_the_excluded_event() {
        let conn = crate::db::open_in_memory().expect("db");
        conn.execute_batch(
            "INSERT INTO lab_events(id, title, start_at, end_at, kind, approved, created_at) VALUES
               ('a', 'Workshop', '2026-10-20T09:00:00', '2026-10-20T11:00:00', 'workshop', 1, 't'),
               ('b', 'Visit', '2026-10-20T10:30:00', '2026-10-20T12:00:00', 'visit', 0, 't'),
               ('c', 'Later', '2026-10-20T13:00:00', '2026-10-20T14:00:00', 'internal', 1, 't');",
        )
        .expect("seed");
        let found = bookings(&conn, dt("2026-10-20T10:00"), dt("2026-10-20T11:00"), None)
            .expect("q");
        let ids: Vec<&str> = found.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let found = bookings(&conn, dt("2026-10-20T10:00"), dt("2026-10-20T11:00"), Some("a"))
            .expect("q");
        assert_eq!(found.len(), 1);
        assert!(!found[0].approved);
    }

    #[test]
    fn contact_prefers_the_visit_form_address() {
        let conn = crate::db::open_in_memory().expect("db");
        conn.execute_batch(
            "INSERT INTO users(id, username, email, first_name, password_salt, password_hash, created_at, updated_at)
               VALUES('u', 'ana', 'ana@uni.br', 'Ana', 's', 'h', 't', 't');",
        )
        .expect("seed");
        let mut ev = LabEvent {
            id: "e".into(),
            title: "Visit".into(),
            description: "Requester: Bia\nEmail: bia@school.org\nPhone: 1".into(),
            start: dt("2026-10-20T10:00"),
            end: dt("2026-10-20T11:00"),
            kind: "visit".into(),
            created_by: Some("u".into()),
            creator: Some("ana".into()),
            approved: false,
            created_at: "t".into(),
        };
        assert_eq!(ev.contact(&conn).expect("q").as_deref(), Some("bia@school.org"));
        ev.description = "Internal session".into();
        assert_eq!(ev.contact(&conn).expect("q").as_deref(), Some("ana@uni.br"));
    }
}
