use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::audit::{max_severity, Severity};
use crate::clock::fmt_date;
use crate::ipc::helpers::{
    db_conn, db_err, finish, invalid, need_date, opt_i64, opt_str, params, require_staff,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};

const MAX_DAYS: i64 = 365;

fn day_severities(
    conn: &Connection,
    limit: i64,
) -> rusqlite::Result<Vec<(String, i64, Vec<String>)>> {
    let mut stmt = conn.prepare(
        "SELECT date, COUNT(*), GROUP_CONCAT(DISTINCT severity)
         FROM audit_actions GROUP BY date ORDER BY date DESC LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |r| {
            let sev: Option<String> = r.get(2)?;
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                sev.map(|s| s.split(',').map(str::to_string).collect())
                    .unwrap_or_default(),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

fn handle_days(state: &mut AppState, req: &Request) -> HandlerResult {
    require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let limit = opt_i64(req, params(req)?, "limit")?.unwrap_or(60);
    if !(1..=MAX_DAYS).contains(&limit) {
        return Err(invalid(req, "limit", "limit must be 1 to 365"));
    }
    let rows = day_severities(conn, limit).map_err(|e| db_err(req, "db_query_failed", e))?;
    let days: Vec<Value> = rows
        .into_iter()
        .map(|(date, count, sevs)| {
            let worst = max_severity(sevs.iter().filter_map(|s| Severity::parse(s)));
            json!({
                "date": date,
                "count": count,
                "maxSeverity": worst.as_str(),
                "cssClass": worst.css_class(),
            })
        })
        .collect();
    Ok(json!({ "days": days }))
}

fn handle_day(state: &mut AppState, req: &Request) -> HandlerResult {
    require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let date = fmt_date(need_date(req, p, "date")?);
    let severity = match opt_str(req, p, "severity")? {
        None => None,
        Some(raw) => Some(
            Severity::parse(&raw)
                .ok_or_else(|| {
                    invalid(req, "severity", "use info, warning, error, critical or security")
                })?,
        ),
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, author, action_type, description, time, method, severity
             FROM audit_actions
             WHERE date = ?1 AND (?2 IS NULL OR severity = ?2)
             ORDER BY time, id",
        )
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let rows = stmt
        .query_map(params![date, severity.map(Severity::as_str)], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, String>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err(req, "db_query_failed", e))?;

    let (mut errors, mut warnings, mut security) = (0, 0, 0);
    let entries: Vec<Value> = rows
        .into_iter()
        .map(|(id, author, action_type, description, time, method, sev_raw)| {
            let sev = Severity::parse(&sev_raw).unwrap_or(Severity::Info);
            match sev {
                Severity::Error | Severity::Critical => errors += 1,
                Severity::Warning => warnings += 1,
                Severity::Security => security += 1,
                Severity::Info => {}
            }
            json!({
                "id": id,
                "author": author.unwrap_or_else(|| "System".to_string()),
                "type": action_type,
                "description": description,
                "time": time,
                "method": method,
                "severity": sev.as_str(),
                "isError": sev.is_error(),
                "isWarning": sev == Severity::Warning,
                "isSecurity": sev == Severity::Security,
                "cssClass": sev.css_class(),
            })
        })
        .collect();
    let total = entries.len();
    Ok(json!({
        "date": date,
        "entries": entries,
        "stats": {
            "total": total,
            "errors": errors,
            "warnings": warnings,
            "security": security,
        },
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "audit.days" => handle_days(state, req),
        "audit.day" => handle_day(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{record, Entry};
    use crate::clock::parse_date_time;

    #[test]
    fn days_report_the_worst_severity() {
        let conn = crate::db::open_in_memory().expect("db");
        let at = parse_date_time("2026-10-16T09:00").expect("dt");
        for sev in [Severity::Info, Severity::Security, Severity::Warning] {
            record(
                &conn,
                at,
                &Entry {
                    author: Some("ana"),
                    action_type: "Test",
                    description: "entry",
                    method: None,
                    severity: sev,
                },
            )
            .expect("record");
        }
        let rows = day_severities(&conn, 10).expect("days");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, 3);
        let worst = max_severity(rows[0].2.iter().filter_map(|s| Severity::parse(s)));
        assert_eq!(worst, Severity::Security);
    }
}
