use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde_json::{json, Map, Value};

use super::courses::owned_course;
use super::setup::{calendar_settings, CalendarSettings};
use crate::calendar::{
    calendar_kind_color, duration_hours, first_week_dates, month_bounds, month_name_en,
    month_weeks, next_month, normalize_month, parse_weekdays, prev_month, slot_occurrences,
    weekdays_csv, ClassSlot, Occurrence, Period, Recurrence, RecurrenceKind, MAX_OCCURRENCES,
    WEEKDAY_LABELS_SUN_FIRST,
};
use crate::clock::{fmt_date, fmt_date_time, parse_date, parse_date_time, parse_time};
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, finish, forbidden, invalid, need_date_time, need_str, new_id,
    not_found, object, only_keys, opt_bool, opt_date, opt_date_time, opt_i64, opt_str, params,
    require_user, validation, HandlerResult,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use crate::validate::{is_hex_color, ValidationError};

const KINDS: [&str; 6] = ["exam", "class", "assignment", "study", "meeting", "other"];
const UPCOMING_HORIZON_DAYS: i64 = 60;

struct CalEvent {
    id: String,
    owner_id: String,
    title: String,
    description: String,
    start: NaiveDateTime,
    end: NaiveDateTime,
    kind: String,
    course_id: Option<String>,
    course_name: Option<String>,
    custom_color: Option<String>,
    reminder: bool,
    reminder_minutes: i64,
    created_at: String,
    updated_at: String,
}

impl CalEvent {
    fn color(&self) -> String {
        self.custom_color
            .clone()
            .unwrap_or_else(|| calendar_kind_color(&self.kind).to_string())
    }

    fn to_json(&self, recurrence: Option<&Recurrence>) -> Value {
        json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "start": fmt_date_time(self.start),
            "end": fmt_date_time(self.end),
            "kind": self.kind,
            "courseId": self.course_id,
            "courseName": self.course_name,
            "customColor": self.custom_color,
            "color": self.color(),
            "reminder": self.reminder,
            "reminderMinutes": self.reminder_minutes,
            "durationHours": duration_hours(self.start, self.end),
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
            "recurrence": recurrence.map(recurrence_json),
        })
    }

    fn occurrence_at(&self, start: NaiveDateTime) -> Occurrence {
        let expanded = start != self.start;
        Occurrence {
            id: if expanded {
                format!("{}_{}", self.id, start.format("%Y%m%d%H%M"))
            } else {
                self.id.clone()
            },
            source: if expanded { "recurrence" } else { "event" },
            event_id: Some(self.id.clone()),
            title: self.title.clone(),
            description: self.description.clone(),
            start,
            end: start + (self.end - self.start),
            kind: self.kind.clone(),
            color: self.color(),
            course_id: self.course_id.clone(),
            course_name: self.course_name.clone(),
            location: String::new(),
            is_fixed_slot: false,
        }
    }
}

fn recurrence_json(r: &Recurrence) -> Value {
    json!({
        "kind": r.kind.as_str(),
        "interval": r.interval,
        "until": r.until.map(fmt_date),
        "weekdays": r.weekdays,
    })
}

const EVENT_SELECT: &str = "SELECT e.id, e.owner_id, e.title, e.description, e.start_at, e.end_at, e.kind,
        e.course_id, c.name, e.custom_color, e.reminder, e.reminder_minutes, e.created_at, e.updated_at
     FROM calendar_events e LEFT JOIN courses c ON c.id = e.course_id";

fn event_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CalEvent> {
    let start: String = r.get(4)?;
    let end: String = r.get(5)?;
    Ok(CalEvent {
        id: r.get(0)?,
        owner_id: r.get(1)?,
        title: r.get(2)?,
        description: r.get(3)?,
        start: parse_date_time(&start).unwrap_or_default(),
        end: parse_date_time(&end).unwrap_or_default(),
        kind: r.get(6)?,
        course_id: r.get(7)?,
        course_name: r.get(8)?,
        custom_color: r.get(9)?,
        reminder: r.get::<_, i64>(10)? != 0,
        reminder_minutes: r.get(11)?,
        created_at: r.get(12)?,
        updated_at: r.get(13)?,
    })
}

fn load_event(conn: &Connection, id: &str) -> rusqlite::Result<Option<CalEvent>> {
    conn.query_row(&format!("{EVENT_SELECT} WHERE e.id = ?"), [id], event_from_row)
        .optional()
}

fn own_event(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    id: &str,
) -> Result<CalEvent, Value> {
    let ev = load_event(conn, id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "event"))?;
    if ev.owner_id != user.id {
        return Err(forbidden(req, "this event belongs to another user"));
    }
    Ok(ev)
}

fn recurrence_from_parts(
    id: &str,
    kind: &str,
    interval: i64,
    until: Option<String>,
    weekdays: &str,
) -> Option<Recurrence> {
    let built = RecurrenceKind::parse(kind)
        .ok_or_else(|| format!("unknown kind {kind}"))
        .and_then(|k| {
            let days = parse_weekdays(weekdays)?;
            let until = until.as_deref().and_then(parse_date);
            Recurrence::new(k, interval.clamp(0, u32::MAX as i64) as u32, until, days)
        });
    match built {
        Ok(r) => Some(r),
        Err(e) => {
            log::warn!("event=recurrence_ignored event_id={id} err={e}");
            None
        }
    }
}

fn load_recurrence(conn: &Connection, event_id: &str) -> rusqlite::Result<Option<Recurrence>> {
    let row = conn
        .query_row(
            "SELECT kind, interval_n, until_date, weekdays FROM calendar_recurrences WHERE event_id = ?",
            [event_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    Ok(row.and_then(|(kind, interval, until, days)| {
        recurrence_from_parts(event_id, &kind, interval, until, &days)
    }))
}

fn owner_recurrences(
    conn: &Connection,
    owner_id: &str,
) -> rusqlite::Result<HashMap<String, Recurrence>> {
    let mut stmt = conn.prepare(
        "SELECT r.event_id, r.kind, r.interval_n, r.until_date, r.weekdays
         FROM calendar_recurrences r JOIN calendar_events e ON e.id = r.event_id
         WHERE e.owner_id = ?",
    )?;
    let rows = stmt
        .query_map([owner_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, kind, interval, until, days)| {
            recurrence_from_parts(&id, &kind, interval, until, &days).map(|r| (id, r))
        })
        .collect())
}

fn save_recurrence(
    conn: &Connection,
    event_id: &str,
    rec: Option<&Recurrence>,
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM calendar_recurrences WHERE event_id = ?", [event_id])?;
    if let Some(r) = rec {
        conn.execute(
            "INSERT INTO calendar_recurrences(event_id, kind, until_date, interval_n, weekdays)
             VALUES(?, ?, ?, ?, ?)",
            params![
                event_id,
                r.kind.as_str(),
                r.until.map(fmt_date),
                r.interval,
                weekdays_csv(&r.weekdays)
            ],
        )?;
    }
    Ok(())
}

/// Parses a recurrence object; `null` or absence clears it.
fn parse_recurrence(
    req: &Request,
    raw: Option<&Value>,
    first: NaiveDateTime,
) -> Result<Option<Recurrence>, Value> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let obj = raw
        .as_object()
        .ok_or_else(|| bad_params(req, "recurrence must be an object or null"))?;
    only_keys(req, obj, &["kind", "interval", "until", "weekdays"])?;
    let kind_raw = need_str(req, obj, "kind")?;
    let kind = RecurrenceKind::parse(&kind_raw).ok_or_else(|| {
        invalid(
            req,
            "recurrence.kind",
            "kind must be daily, weekly, biweekly, monthly or yearly",
        )
    })?;
    let interval = opt_i64(req, obj, "interval")?.unwrap_or(1);
    if !(1..=52).contains(&interval) {
        return Err(invalid(req, "recurrence.interval", "interval must be between 1 and 52"));
    }
    let until = opt_date(req, obj, "until")
        .map_err(|_| invalid(req, "recurrence.until", "enter a valid date (YYYY-MM-DD)"))?;
    if let Some(u) = until {
        if u < first.date() {
            return Err(invalid(
                req,
                "recurrence.until",
                "the end date cannot precede the first occurrence",
            ));
        }
    }
    let weekdays = match obj.get("weekdays") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => {
            parse_weekdays(s).map_err(|m| invalid(req, "recurrence.weekdays", m))?
        }
        Some(Value::Array(items)) => {
            let csv = items
                .iter()
                .map(|v| {
                    v.as_i64()
                        .map(|n| n.to_string())
                        .ok_or_else(|| {
                            invalid(req, "recurrence.weekdays", "weekdays must be numbers 1 to 7")
                        })
                })
                .collect::<Result<Vec<_>, _>>()?
                .join(",");
            parse_weekdays(&csv).map_err(|m| invalid(req, "recurrence.weekdays", m))?
        }
        Some(_) => return Err(invalid(req, "recurrence.weekdays", "weekdays must be a list")),
    };
    Recurrence::new(kind, interval as u32, until, weekdays)
        .map(Some)
        .map_err(|m| invalid(req, "recurrence", m))
}

/// Chronological order, keeping at most `MAX_OCCURRENCES` per query.
fn sort_and_cap(occs: &mut Vec<Occurrence>) {
    occs.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.title.cmp(&b.title)));
    occs.truncate(MAX_OCCURRENCES);
}

pub struct EventFilter {
    pub owner_id: String,
    pub kinds: Vec<String>,
    pub course_id: Option<String>,
}

/// Stored events of the window with recurring series expanded. With no
/// window every stored event is returned once.
fn stored_occurrences(
    conn: &Connection,
    filter: &EventFilter,
    window: Option<(NaiveDateTime, NaiveDateTime)>,
) -> rusqlite::Result<Vec<Occurrence>> {
    let mut clauses = vec!["e.owner_id = ?1".to_string()];
    let mut binds: Vec<&dyn ToSql> = Vec::new();
    binds.push(&filter.owner_id);
    let bounds = window.map(|(a, b)| (fmt_date_time(a), fmt_date_time(b)));
    if let Some((from, to)) = bounds.as_ref() {
        binds.push(from);
        binds.push(to);
        clauses.push(
            "((e.start_at < ?3 AND e.end_at > ?2)
              OR (e.start_at < ?3 AND e.id IN (SELECT event_id FROM calendar_recurrences)))"
                .to_string(),
        );
    }
    if !filter.kinds.is_empty() {
        let mut marks = Vec::new();
        for k in &filter.kinds {
            binds.push(k);
            marks.push(format!("?{}", binds.len()));
        }
        clauses.push(format!("e.kind IN ({})", marks.join(", ")));
    }
    if let Some(cid) = filter.course_id.as_ref() {
        binds.push(cid);
        clauses.push(format!("e.course_id = ?{}", binds.len()));
    }
    let mut stmt = conn.prepare(&format!(
        "{EVENT_SELECT} WHERE {} ORDER BY e.start_at",
        clauses.join(" AND ")
    ))?;
    let events = stmt
        .query_map(binds.as_slice(), event_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let Some((from, to)) = window else {
        return Ok(events.iter().map(|e| e.occurrence_at(e.start)).collect());
    };
    let recurrences = owner_recurrences(conn, &filter.owner_id)?;
    let mut out = Vec::new();
    for ev in &events {
        match recurrences.get(&ev.id) {
            None => {
                if ev.start < to && ev.end > from {
                    out.push(ev.occurrence_at(ev.start));
                }
            }
            Some(rec) => {
                let span = ev.end - ev.start;
                for start in rec.occurrences(ev.start, from - span, to) {
                    if start + span > from {
                        out.push(ev.occurrence_at(start));
                    }
                }
            }
        }
    }
    sort_and_cap(&mut out);
    Ok(out)
}

/// Virtual class events for the owner's active slots, limited to each
/// semester's own date range.
pub fn slot_events(
    conn: &Connection,
    owner_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> rusqlite::Result<Vec<Occurrence>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.course_id, c.name, s.weekday, s.start_time, s.end_time, s.location, s.notes,
                sm.start_date, sm.end_date
         FROM schedule_slots s
         JOIN courses c ON c.id = s.course_id
         JOIN semesters sm ON sm.id = c.semester_id
         WHERE sm.owner_id = ? AND s.active = 1 AND c.active = 1 AND sm.active = 1",
    )?;
    let rows = stmt
        .query_map([owner_id], |r| {
            let start: String = r.get(4)?;
            let end: String = r.get(5)?;
            let sem_start: String = r.get(8)?;
            let sem_end: String = r.get(9)?;
            Ok((
                ClassSlot {
                    slot_id: r.get(0)?,
                    course_id: r.get(1)?,
                    course_name: r.get(2)?,
                    weekday: r.get::<_, i64>(3)? as u32,
                    start: parse_time(&start).unwrap_or_default(),
                    end: parse_time(&end).unwrap_or_default(),
                    location: r.get(6)?,
                    notes: r.get(7)?,
                },
                parse_date(&sem_start),
                parse_date(&sem_end),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    let mut out = Vec::new();
    for (slot, sem_start, sem_end) in rows {
        let lo = sem_start.map_or(from, |d| d.max(from));
        let hi = sem_end.map_or(to, |d| d.min(to));
        if lo <= hi {
            out.extend(slot_occurrences(std::slice::from_ref(&slot), lo, hi));
        }
    }
    Ok(out)
}

fn day_start(d: NaiveDate) -> NaiveDateTime {
    d.and_time(NaiveTime::MIN)
}

/// Stored, expanded and slot occurrences in `[from, to]` (whole days).
pub fn all_occurrences(
    conn: &Connection,
    owner_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> rusqlite::Result<Vec<Occurrence>> {
    let filter = EventFilter {
        owner_id: owner_id.to_string(),
        kinds: Vec::new(),
        course_id: None,
    };
    let mut out = stored_occurrences(
        conn,
        &filter,
        Some((day_start(from), day_start(to) + Duration::days(1))),
    )?;
    out.extend(slot_events(conn, owner_id, from, to)?);
    sort_and_cap(&mut out);
    Ok(out)
}

fn occurrence_value(req: &Request, o: &Occurrence) -> Result<Value, Value> {
    serde_json::to_value(o).map_err(|e| err(&req.id, "internal", e.to_string(), None))
}

fn to_values(req: &Request, occs: &[Occurrence]) -> Result<Vec<Value>, Value> {
    occs.iter().map(|o| occurrence_value(req, o)).collect()
}

struct EventInput {
    title: String,
    description: String,
    start: NaiveDateTime,
    end: NaiveDateTime,
    kind: String,
    course_id: Option<String>,
    custom_color: Option<String>,
    reminder: bool,
    reminder_minutes: i64,
}

fn check_event(
    conn: &Connection,
    req: &Request,
    user: &SessionUser,
    input: &EventInput,
    settings: &CalendarSettings,
) -> Result<(), Value> {
    let mut v = ValidationError::new();
    if input.title.chars().count() > 200 {
        v.add("title", "title must be at most 200 characters");
    }
    if !KINDS.contains(&input.kind.as_str()) {
        v.add("kind", format!("kind must be one of {}", KINDS.join(", ")));
    }
    if input.end <= input.start {
        v.add("end", "the end must be after the start");
    } else if duration_hours(input.start, input.end) > settings.max_event_hours as f64 {
        v.add(
            "end",
            format!("events cannot last more than {} hours", settings.max_event_hours),
        );
    }
    if !(5..=1440).contains(&input.reminder_minutes) {
        v.add("reminderMinutes", "reminder must be between 5 and 1440 minutes");
    }
    if let Some(c) = input.custom_color.as_deref() {
        if !is_hex_color(c) {
            v.add("customColor", "use a hex color such as #FF7A00");
        }
    }
    v.into_result().map_err(|e| validation(req, e))?;
    if let Some(cid) = input.course_id.as_deref() {
        owned_course(conn, req, user, cid)?;
    }
    Ok(())
}

fn lower_kind(req: &Request, src: &Map<String, Value>, fallback: &str) -> Result<String, Value> {
    Ok(opt_str(req, src, "kind")?
        .map(|k| k.to_ascii_lowercase())
        .unwrap_or_else(|| fallback.to_string()))
}

fn event_payload(
    conn: &Connection,
    req: &Request,
    ev: &CalEvent,
) -> HandlerResult {
    let rec = load_recurrence(conn, &ev.id).map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(ev.to_json(rec.as_ref()))
}

fn handle_events_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let settings = calendar_settings(conn);
    let e = object(req, p, "event")?;
    let input = EventInput {
        title: opt_str(req, e, "title")?.ok_or_else(|| invalid(req, "title", "title is required"))?,
        description: opt_str(req, e, "description")?.unwrap_or_default(),
        start: need_date_time(req, e, "start")?,
        end: need_date_time(req, e, "end")?,
        kind: lower_kind(req, e, "other")?,
        course_id: opt_str(req, e, "courseId")?,
        custom_color: opt_str(req, e, "customColor")?,
        reminder: opt_bool(req, e, "reminder")?.unwrap_or(true),
        reminder_minutes: opt_i64(req, e, "reminderMinutes")?
            .unwrap_or(settings.default_reminder_minutes),
    };
    check_event(conn, req, &user, &input, &settings)?;
    let recurrence = parse_recurrence(req, p.get("recurrence"), input.start)?;

    let id = new_id();
    let now_s = fmt_date_time(now);
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO calendar_events(id, owner_id, title, description, start_at, end_at, kind, course_id,
             custom_color, reminder, reminder_minutes, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            user.id,
            input.title,
            input.description,
            fmt_date_time(input.start),
            fmt_date_time(input.end),
            input.kind,
            input.course_id,
            input.custom_color,
            input.reminder as i64,
            input.reminder_minutes,
            now_s,
            now_s
        ],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    save_recurrence(&tx, &id, recurrence.as_ref()).map_err(|e| db_err(req, "db_insert_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;

    let ev = load_event(conn, &id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "event"))?;
    Ok(json!({ "eventId": id, "event": ev.to_json(recurrence.as_ref()) }))
}

fn handle_events_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let settings = calendar_settings(conn);
    let event_id = need_str(req, p, "eventId")?;
    let patch = object(req, p, "patch")?;
    only_keys(
        req,
        patch,
        &[
            "title",
            "description",
            "start",
            "end",
            "kind",
            "courseId",
            "customColor",
            "reminder",
            "reminderMinutes",
        ],
    )?;
    let cur = own_event(conn, req, &user, &event_id)?;
    let keep_or = |key: &str, current: Option<String>| -> Result<Option<String>, Value> {
        if patch.contains_key(key) {
            opt_str(req, patch, key)
        } else {
            Ok(current)
        }
    };
    let input = EventInput {
        title: match patch.get("title") {
            None => cur.title.clone(),
            Some(_) => opt_str(req, patch, "title")?
                .ok_or_else(|| invalid(req, "title", "title is required"))?,
        },
        description: keep_or("description", Some(cur.description.clone()))?.unwrap_or_default(),
        start: opt_date_time(req, patch, "start")?.unwrap_or(cur.start),
        end: opt_date_time(req, patch, "end")?.unwrap_or(cur.end),
        kind: lower_kind(req, patch, &cur.kind)?,
        course_id: keep_or("courseId", cur.course_id.clone())?,
        custom_color: keep_or("customColor", cur.custom_color.clone())?,
        reminder: opt_bool(req, patch, "reminder")?.unwrap_or(cur.reminder),
        reminder_minutes: opt_i64(req, patch, "reminderMinutes")?.unwrap_or(cur.reminder_minutes),
    };
    check_event(conn, req, &user, &input, &settings)?;
    conn.execute(
        "UPDATE calendar_events SET title = ?, description = ?, start_at = ?, end_at = ?, kind = ?,
             course_id = ?, custom_color = ?, reminder = ?, reminder_minutes = ?, updated_at = ?
         WHERE id = ?",
        params![
            input.title,
            input.description,
            fmt_date_time(input.start),
            fmt_date_time(input.end),
            input.kind,
            input.course_id,
            input.custom_color,
            input.reminder as i64,
            input.reminder_minutes,
            fmt_date_time(now),
            event_id
        ],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    let ev = own_event(conn, req, &user, &event_id)?;
    Ok(json!({ "event": event_payload(conn, req, &ev)? }))
}

fn handle_events_open(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let now = state.clock.now();
    let event_id = need_str(req, params(req)?, "eventId")?;
    let ev = own_event(conn, req, &user, &event_id)?;
    let rec = load_recurrence(conn, &ev.id).map_err(|e| db_err(req, "db_query_failed", e))?;
    let next: Vec<String> = match rec.as_ref() {
        Some(r) => r
            .occurrences(ev.start, now, now + Duration::days(366))
            .into_iter()
            .take(5)
            .map(fmt_date_time)
            .collect(),
        None if ev.start >= now => vec![fmt_date_time(ev.start)],
        None => Vec::new(),
    };
    Ok(json!({
        "event": ev.to_json(rec.as_ref()),
        "nextOccurrences": next,
        "isPast": ev.end < now,
    }))
}

fn handle_events_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let event_id = need_str(req, params(req)?, "eventId")?;
    own_event(conn, req, &user, &event_id)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    tx.execute("DELETE FROM calendar_recurrences WHERE event_id = ?", [&event_id])
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    tx.execute("DELETE FROM calendar_events WHERE id = ?", [&event_id])
        .map_err(|e| db_err(req, "db_delete_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;
    Ok(json!({ "deleted": true }))
}

fn handle_recurrence_set(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let event_id = need_str(req, p, "eventId")?;
    if !p.contains_key("recurrence") {
        return Err(bad_params(req, "missing recurrence (use null to clear)"));
    }
    let ev = own_event(conn, req, &user, &event_id)?;
    let rec = parse_recurrence(req, p.get("recurrence"), ev.start)?;
    save_recurrence(conn, &event_id, rec.as_ref()).map_err(|e| db_err(req, "db_update_failed", e))?;
    Ok(json!({ "event": ev.to_json(rec.as_ref()) }))
}

fn handle_events_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let today = state.clock.today();
    let period = match opt_str(req, p, "period")? {
        None => Period::Today,
        Some(raw) => Period::parse(&raw)
            .ok_or_else(|| invalid(req, "period", "use today, week, month or custom"))?,
    };
    let from = opt_date(req, p, "from")?;
    let to = opt_date(req, p, "to")?;
    let window = period.window(today, from, to);
    if let Some((a, b)) = window {
        if b < a {
            return Err(invalid(req, "to", "the end date must not precede the start date"));
        }
    }
    let mut kinds = Vec::new();
    if let Some(raw) = p.get("kinds").filter(|v| !v.is_null()) {
        let items = raw
            .as_array()
            .ok_or_else(|| bad_params(req, "kinds must be an array"))?;
        for item in items {
            let k = item
                .as_str()
                .map(|s| s.trim().to_ascii_lowercase())
                .ok_or_else(|| bad_params(req, "kinds must be an array of strings"))?;
            if !KINDS.contains(&k.as_str()) {
                return Err(invalid(req, "kinds", format!("unknown kind {k}")));
            }
            kinds.push(k);
        }
    }
    let filter = EventFilter {
        owner_id: user.id.clone(),
        kinds,
        course_id: opt_str(req, p, "courseId")?,
    };
    let occs = stored_occurrences(
        conn,
        &filter,
        window.map(|(a, b)| (day_start(a), day_start(b) + Duration::days(1))),
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    let mut by_kind: BTreeMap<String, i64> = BTreeMap::new();
    for o in &occs {
        *by_kind.entry(o.kind.clone()).or_default() += 1;
    }
    Ok(json!({
        "from": window.map(|w| fmt_date(w.0)),
        "to": window.map(|w| fmt_date(w.1)),
        "events": to_values(req, &occs)?,
        "total": occs.len(),
        "byKind": by_kind,
    }))
}

/// `YYYY-MM-DD` bounds cover whole days; date-times are taken as given.
fn feed_bound(
    req: &Request,
    p: &Map<String, Value>,
    key: &str,
    is_end: bool,
) -> Result<NaiveDateTime, Value> {
    let raw = need_str(req, p, key)?;
    if let Some(dt) = parse_date_time(&raw) {
        return Ok(dt);
    }
    let day = parse_date(&raw).ok_or_else(|| invalid(req, key, "enter a date or date-time"))?;
    Ok(if is_end {
        day_start(day) + Duration::days(1)
    } else {
        day_start(day)
    })
}

fn handle_feed(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let start = feed_bound(req, p, "start", false)?;
    let end = feed_bound(req, p, "end", true)?;
    if end <= start {
        return Err(invalid(req, "end", "the end must be after the start"));
    }
    if end - start > Duration::days(366) {
        return Err(invalid(req, "end", "the feed window is limited to one year"));
    }
    let filter = EventFilter {
        owner_id: user.id.clone(),
        kinds: Vec::new(),
        course_id: None,
    };
    let mut occs = stored_occurrences(conn, &filter, Some((start, end)))
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let last_day = (end - Duration::seconds(1)).date();
    occs.extend(
        slot_events(conn, &user.id, start.date(), last_day)
            .map_err(|e| db_err(req, "db_query_failed", e))?
            .into_iter()
            .filter(|o| o.end > start && o.start < end),
    );
    sort_and_cap(&mut occs);
    Ok(Value::Array(to_values(req, &occs)?))
}

fn handle_month(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let now = state.clock.now();
    let today = now.date();
    let settings = calendar_settings(conn);

    let year = opt_i64(req, p, "year")?.unwrap_or(today.year() as i64);
    if !(1900..=2200).contains(&year) {
        return Err(invalid(req, "year", "year out of range"));
    }
    let month = opt_i64(req, p, "month")?.unwrap_or(today.month() as i64);
    let month = month.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    let (year, month) = normalize_month(year as i32, month);
    let weekly = match opt_str(req, p, "view")?.as_deref() {
        None | Some("monthly") => false,
        Some("weekly") => true,
        Some(_) => return Err(invalid(req, "view", "use monthly or weekly")),
    };
    let (first, last) = month_bounds(year, month)
        .ok_or_else(|| invalid(req, "month", "invalid month"))?;
    let week_dates = if weekly { first_week_dates(year, month) } else { Vec::new() };
    let from = week_dates.first().copied().map_or(first, |d| d.min(first));
    let occs = all_occurrences(conn, &user.id, from, last)
        .map_err(|e| db_err(req, "db_query_failed", e))?;

    let mut by_day: BTreeMap<String, Vec<&Occurrence>> = BTreeMap::new();
    for o in occs.iter().filter(|o| o.start.date() >= first && o.start.date() <= last) {
        by_day.entry(o.start.day().to_string()).or_default().push(o);
    }
    let mut events_by_day = Map::new();
    for (day, list) in by_day {
        let values = list
            .into_iter()
            .map(|o| occurrence_value(req, o))
            .collect::<Result<Vec<_>, _>>()?;
        events_by_day.insert(day, Value::Array(values));
    }

    let today_occs = all_occurrences(conn, &user.id, today, today)
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let filter = EventFilter {
        owner_id: user.id.clone(),
        kinds: Vec::new(),
        course_id: None,
    };
    let upcoming: Vec<Occurrence> = stored_occurrences(
        conn,
        &filter,
        Some((now, now + Duration::days(UPCOMING_HORIZON_DAYS))),
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?
    .into_iter()
    .filter(|o| o.start >= now)
    .take(3)
    .collect();

    let (py, pm) = prev_month(year, month);
    let (ny, nm) = next_month(year, month);
    let mut out = json!({
        "year": year,
        "month": month,
        "monthName": month_name_en(month),
        "view": if weekly { "weekly" } else { "monthly" },
        "weekdayLabels": WEEKDAY_LABELS_SUN_FIRST,
        "weeks": month_weeks(year, month),
        "eventsByDay": events_by_day,
        "prev": { "year": py, "month": pm, "monthName": month_name_en(pm) },
        "next": { "year": ny, "month": nm, "monthName": month_name_en(nm) },
        "today": fmt_date(today),
        "todayCount": today_occs.len(),
        "upcoming": to_values(req, &upcoming)?,
    });

    if weekly {
        let hours: Vec<u32> = (settings.week_start_hour..=settings.week_end_hour).collect();
        let mut grid = Vec::with_capacity(hours.len());
        for hour in &hours {
            let mut row = Vec::with_capacity(7);
            for date in &week_dates {
                let cell: Vec<&Occurrence> = occs
                    .iter()
                    .filter(|o| o.start.date() == *date && o.start.hour() == *hour)
                    .collect();
                row.push(
                    cell.into_iter()
                        .map(|o| occurrence_value(req, o))
                        .collect::<Result<Vec<_>, _>>()?,
                );
            }
            grid.push(json!({ "hour": hour, "label": format!("{hour:02}:00"), "days": row }));
        }
        out["weekDates"] = json!(week_dates.iter().map(|d| fmt_date(*d)).collect::<Vec<_>>());
        out["hours"] = json!(hours);
        out["hourGrid"] = Value::Array(grid);
    }
    Ok(out)
}

fn handle_dashboard(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let now = state.clock.now();
    let today = now.date();
    let settings = calendar_settings(conn);

    let today_occs = all_occurrences(conn, &user.id, today, today)
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let filter = EventFilter {
        owner_id: user.id.clone(),
        kinds: Vec::new(),
        course_id: None,
    };
    let upcoming: Vec<Occurrence> = stored_occurrences(
        conn,
        &filter,
        Some((now, now + Duration::days(settings.upcoming_days))),
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?
    .into_iter()
    .filter(|o| o.start >= now)
    .take(5)
    .collect();
    let (first, last) = month_bounds(today.year(), today.month())
        .ok_or_else(|| invalid(req, "month", "invalid month"))?;
    let month_occs = stored_occurrences(
        conn,
        &filter,
        Some((day_start(first), day_start(last) + Duration::days(1))),
    )
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    let mut by_kind: BTreeMap<&str, i64> = KINDS.iter().map(|k| (*k, 0)).collect();
    for o in &month_occs {
        if let Some(n) = by_kind.get_mut(o.kind.as_str()) {
            *n += 1;
        }
    }
    Ok(json!({
        "today": to_values(req, &today_occs)?,
        "upcoming": to_values(req, &upcoming)?,
        "monthTotal": month_occs.len(),
        "byKind": by_kind,
        "monthName": month_name_en(today.month()),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "calendar.events.create" => handle_events_create(state, req),
        "calendar.events.update" => handle_events_update(state, req),
        "calendar.events.open" => handle_events_open(state, req),
        "calendar.events.delete" => handle_events_delete(state, req),
        "calendar.events.list" => handle_events_list(state, req),
        "calendar.recurrence.set" => handle_recurrence_set(state, req),
        "calendar.feed" => handle_feed(state, req),
        "calendar.month" => handle_month(state, req),
        "calendar.dashboard" => handle_dashboard(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Connection {
        let conn = crate::db::open_in_memory().expect("db");
        conn.execute_batch(
            "INSERT INTO users(id, username, email, first_name, password_salt, password_hash, created_at, updated_at)
               VALUES('u', 'ana', 'ana@uni.br', 'Ana', 's', 'h', 't', 't');
             INSERT INTO semesters(id, owner_id, name, year, period, start_date, end_date)
               VALUES('s', 'u', 'S', 2026, '2', '2026-08-01', '2026-12-15');
             INSERT INTO courses(id, semester_id, name, slug, created_at)
               VALUES('c', 's', 'Algebra', 'algebra', 't');
             INSERT INTO schedule_slots(id, course_id, weekday, start_time, end_time, location)
               VALUES('slot1', 'c', 0, '08:00', '10:00', 'Room 12');
             INSERT INTO calendar_events(id, owner_id, title, start_at, end_at, kind, created_at, updated_at)
               VALUES('once', 'u', 'Exam', '2026-10-20T14:00:00', '2026-10-20T16:00:00', 'exam', 't', 't'),
                     ('gym', 'u', 'Gym', '2026-10-01T18:00:00', '2026-10-01T19:00:00', 'other', 't', 't');
             INSERT INTO calendar_recurrences(event_id, kind, interval_n, weekdays)
               VALUES('gym', 'weekly', 1, '');",
        )
        .expect("seed");
        conn
    }

    fn d(s: &str) -> NaiveDate {
        parse_date(s).expect("date")
    }

    #[test]
    fn month_window_expands_series_and_projects_slots() {
        let conn = seed();
        let occs = all_occurrences(&conn, "u", d("2026-10-01"), d("2026-10-31")).expect("occs");
        let gyms: Vec<&Occurrence> = occs.iter().filter(|o| o.title == "Gym").collect();
        assert_eq!(gyms.len(), 5);
        assert_eq!(gyms[0].id, "gym");
        assert_eq!(gyms[1].id, "gym_202610081800");
        assert_eq!(gyms[1].source, "recurrence");

        let slots: Vec<&Occurrence> = occs.iter().filter(|o| o.is_fixed_slot).collect();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].id, "slot_slot1_2026-10-05");
        assert_eq!(slots[0].description, "Regular class - Room 12");
        assert!(occs.iter().any(|o| o.id == "once" && o.color == "#DC3545"));
    }

    #[test]
    fn slots_stop_at_the_semester_end() {
        let conn = seed();
        let occs = slot_events(&conn, "u", d("2026-12-01"), d("2026-12-31")).expect("slots");
        let days: Vec<String> = occs.iter().map(|o| fmt_date(o.start.date())).collect();
        assert_eq!(days, vec!["2026-12-07", "2026-12-14"]);
    }

    #[test]
    fn kind_filter_skips_other_events() {
        let conn = seed();
        let filter = EventFilter {
            owner_id: "u".into(),
            kinds: vec!["exam".into()],
            course_id: None,
        };
        let from = day_start(d("2026-10-01"));
        let occs = stored_occurrences(&conn, &filter, Some((from, from + Duration::days(31))))
            .expect("occs");
        assert_eq!(occs.len(), 1);
        assert_eq!(occs[0].title, "Exam");
    }

    #[test]
    fn a_query_never_returns_more_than_the_cap() {
        let conn = seed();
        conn.execute_batch(
            "INSERT INTO calendar_events(id, owner_id, title, start_at, end_at, kind, created_at, updated_at)
               VALUES('d1', 'u', 'Read', '2026-01-01T07:00:00', '2026-01-01T07:30:00', 'study', 't', 't'),
                     ('d2', 'u', 'Run', '2026-01-01T08:00:00', '2026-01-01T08:30:00', 'other', 't', 't'),
                     ('d3', 'u', 'Write', '2026-01-01T09:00:00', '2026-01-01T09:30:00', 'study', 't', 't');
             INSERT INTO calendar_recurrences(event_id, kind, interval_n, weekdays)
               VALUES('d1', 'daily', 1, ''), ('d2', 'daily', 1, ''), ('d3', 'daily', 1, '');",
        )
        .expect("series");
        let occs = all_occurrences(&conn, "u", d("2026-01-01"), d("2026-12-31")).expect("occs");
        assert_eq!(occs.len(), MAX_OCCURRENCES);
        assert!(occs.windows(2).all(|w| w[0].start <= w[1].start));
        assert_eq!(fmt_date(occs[0].start.date()), "2026-01-01");
    }
}
