use std::collections::HashSet;
use std::path::PathBuf;

use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::audit::{self, Severity};
use crate::clock::fmt_date_time;
use crate::google::{self, GoogleError, GoogleEvent};
use crate::ipc::error::err;
use crate::ipc::helpers::{
    db_conn, db_err, finish, invalid, opt_str, params, require_superuser, workspace, HandlerResult,
};
use crate::ipc::types::{AppState, Request};

#[derive(Debug, Default, PartialEq, Eq)]
struct SyncCounts {
    inserted: usize,
    updated: usize,
    removed: usize,
}

/// Mirrors the feed into `google_events`: upsert by Google id, then drop
/// rows the feed no longer lists.
fn apply_feed(
    conn: &Connection,
    events: &[GoogleEvent],
    synced_at: &str,
) -> rusqlite::Result<SyncCounts> {
    let mut counts = SyncCounts::default();
    let existing: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT google_id FROM google_events")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<HashSet<_>, _>>())?;
        ids
    };
    let mut seen = HashSet::new();
    for ev in events {
        conn.execute(
            "INSERT INTO google_events(google_id, summary, description, start_at, end_at, all_day, synced_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(google_id) DO UPDATE SET summary = excluded.summary,
                 description = excluded.description, start_at = excluded.start_at,
                 end_at = excluded.end_at, all_day = excluded.all_day, synced_at = excluded.synced_at",
            params![
                ev.google_id,
                ev.summary,
                ev.description,
                fmt_date_time(ev.start),
                fmt_date_time(ev.end),
                ev.all_day as i64,
                synced_at
            ],
        )?;
        if existing.contains(&ev.google_id) {
            counts.updated += 1;
        } else {
            counts.inserted += 1;
        }
        seen.insert(ev.google_id.as_str());
    }
    for id in existing.iter().filter(|id| !seen.contains(id.as_str())) {
        counts.removed += conn.execute("DELETE FROM google_events WHERE google_id = ?", [id])?;
    }
    Ok(counts)
}

fn handle_sync(state: &mut AppState, req: &Request) -> HandlerResult {
    let user = require_superuser(state, req)?;
    let conn = db_conn(state, req)?;
    let ws = workspace(state, req)?;
    let now = state.clock.now();

    let has_credentials = google::check_credentials(ws).map_err(|e| match e {
        GoogleError::Io(io) => err(&req.id, "io_failed", io.to_string(), None),
        other => invalid(req, "credentials", other.to_string()),
    })?;
    let path = match opt_str(req, params(req)?, "path")? {
        Some(p) => PathBuf::from(p),
        None => ws.join(google::FEED_FILE_NAME),
    };
    if !path.is_file() {
        return Err(err(
            &req.id,
            "not_found",
            format!("calendar feed not found: {}", path.to_string_lossy()),
            None,
        ));
    }
    let events = google::read_feed(&path).map_err(|e| match e {
        GoogleError::Io(io) => err(&req.id, "io_failed", io.to_string(), None),
        other => invalid(req, "feed", other.to_string()),
    })?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    let counts = apply_feed(&tx, &events, &fmt_date_time(now))
        .map_err(|e| db_err(req, "db_update_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;

    log::info!(
        "event=google_sync inserted={} updated={} removed={} credentials={has_credentials}",
        counts.inserted,
        counts.updated,
        counts.removed
    );
    audit::record_quietly(
        conn,
        now,
        &audit::Entry {
            author: Some(&user.username),
            action_type: "Google sync",
            description: &format!(
                "Imported {} Google Calendar events ({} new, {} removed)",
                events.len(),
                counts.inserted,
                counts.removed
            ),
            method: Some(&req.method),
            severity: Severity::Info,
        },
    );
    Ok(json!({
        "total": events.len(),
        "inserted": counts.inserted,
        "updated": counts.updated,
        "removed": counts.removed,
        "credentialsPresent": has_credentials,
        "syncedAt": fmt_date_time(now),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "google.sync" => handle_sync(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_date_time;

    fn event(id: &str, summary: &str) -> GoogleEvent {
        GoogleEvent {
            google_id: id.to_string(),
            summary: summary.to_string(),
            description: String::new(),
            start: parse_date_time("2026-10-20T10:00").expect("dt"),
            end: parse_date_time("2026-10-20T11:00").expect("dt"),
            all_day: false,
        }
    }

    #[test]
    fn resync_updates_and_prunes() {
        let conn = crate::db::open_in_memory().expect("db");
        let first = apply_feed(&conn, &[event("a", "Seminar"), event("b", "Defense")], "t1")
            .expect("sync");
        assert_eq!(first, SyncCounts { inserted: 2, updated: 0, removed: 0 });

        let second = apply_feed(&conn, &[event("a", "Seminar (moved)"), event("c", "Talk")], "t2")
            .expect("sync");
        assert_eq!(second, SyncCounts { inserted: 1, updated: 1, removed: 1 });

        let summary: String = conn
            .query_row("SELECT summary FROM google_events WHERE google_id = 'a'", [], |r| r.get(0))
            .expect("row");
        assert_eq!(summary, "Seminar (moved)");
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM google_events", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 2);
    }
}
