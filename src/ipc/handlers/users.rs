use crate::accounts::{self, MIN_PASSWORD_LEN, USERNAME_LEN};
use crate::audit::{self, Severity};
use crate::clock::fmt_date_time;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, finish, forbidden, need_str, not_found, object, only_keys,
    opt_bool, opt_i64, opt_str, params, require_staff, require_superuser, require_user,
    validation, HandlerResult,
};
use crate::ipc::types::{AppState, Request, SessionUser};
use crate::validate::{is_email, ValidationError};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

struct UserRow {
    id: String,
    username: String,
    email: String,
    first_name: String,
    last_name: String,
    staff: bool,
    superuser: bool,
    active: bool,
    created_at: String,
}

const USER_COLUMNS: &str =
    "id, username, email, first_name, last_name, is_staff, is_superuser, active, created_at";

fn user_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: r.get(0)?,
        username: r.get(1)?,
        email: r.get(2)?,
        first_name: r.get(3)?,
        last_name: r.get(4)?,
        staff: r.get::<_, i64>(5)? != 0,
        superuser: r.get::<_, i64>(6)? != 0,
        active: r.get::<_, i64>(7)? != 0,
        created_at: r.get(8)?,
    })
}

fn user_json(u: &UserRow) -> Value {
    json!({
        "id": u.id,
        "username": u.username,
        "email": u.email,
        "firstName": u.first_name,
        "lastName": u.last_name,
        "fullName": format!("{} {}", u.first_name, u.last_name).trim().to_string(),
        "initials": accounts::initials(&u.first_name, &u.last_name, &u.username),
        "staff": u.staff,
        "superuser": u.superuser,
        "active": u.active,
        "createdAt": u.created_at,
    })
}

fn load_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<UserRow>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"),
        [user_id],
        user_from_row,
    )
    .optional()
}

/// Address notifications go to; `None` for unknown users.
pub fn user_email(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT email FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()
}

fn session_from(u: &UserRow) -> SessionUser {
    SessionUser {
        id: u.id.clone(),
        username: u.username.clone(),
        staff: u.staff,
        superuser: u.superuser,
    }
}

fn handle_register(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let username = need_str(req, p, "username")?;
    let email = need_str(req, p, "email")?;
    let first_name = need_str(req, p, "firstName")?;
    let last_name = opt_str(req, p, "lastName")?.unwrap_or_default();
    let password = p
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_params(req, "missing password"))?
        .to_string();
    let confirm = p
        .get("passwordConfirm")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_params(req, "missing passwordConfirm"))?
        .to_string();

    let mut v = ValidationError::new();
    if !USERNAME_LEN.contains(&username.chars().count()) {
        v.add("username", "username must be 3 to 150 characters");
    }
    if !is_email(&email) {
        v.add("email", "enter a valid email address");
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        v.add("password", "password must be at least 8 characters");
    }
    if password != confirm {
        v.add("passwordConfirm", "passwords do not match");
    }
    let taken_name: bool = conn
        .query_row("SELECT 1 FROM users WHERE username = ?", [&username], |_| Ok(()))
        .optional()
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .is_some();
    if taken_name {
        v.add("username", "this username is already taken");
    }
    let taken_email: bool = conn
        .query_row("SELECT 1 FROM users WHERE email = ? COLLATE NOCASE", [&email], |_| Ok(()))
        .optional()
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .is_some();
    if taken_email {
        v.add("email", "this email is already registered");
    }
    v.into_result().map_err(|e| validation(req, e))?;

    let existing: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let first_user = existing == 0;

    let id = crate::ipc::helpers::new_id();
    let salt = accounts::new_salt();
    let hash = accounts::hash_password(&salt, &password);
    let ts = fmt_date_time(state.clock.now());
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err(req, "db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO users(id, username, email, first_name, last_name, password_salt, password_hash,
            is_staff, is_superuser, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        params![
            id,
            username,
            email,
            first_name,
            last_name,
            salt,
            hash,
            first_user as i64,
            first_user as i64,
            ts,
            ts
        ],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    tx.execute(
        "INSERT INTO profiles(user_id, updated_at) VALUES(?, ?)",
        params![id, ts],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    tx.commit().map_err(|e| db_err(req, "db_commit_failed", e))?;

    let row = load_user(conn, &id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "user"))?;
    audit::record_quietly(
        conn,
        state.clock.now(),
        &audit::Entry {
            author: Some(&row.username),
            action_type: "Registration",
            description: &format!("New account {}", row.username),
            method: Some(&req.method),
            severity: Severity::Info,
        },
    );
    let body = user_json(&row);
    state.user = Some(session_from(&row));
    log::info!("event=session_start user={} via=register", username);
    Ok(json!({ "user": body }))
}

fn handle_login(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let username = need_str(req, p, "username")?;
    let password = p
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_params(req, "missing password"))?;

    let found: Option<(String, String, bool)> = conn
        .query_row(
            "SELECT id, password_salt || ':' || password_hash, active FROM users WHERE username = ?",
            [&username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get::<_, i64>(2)? != 0)),
        )
        .optional()
        .map_err(|e| db_err(req, "db_query_failed", e))?;

    let verified = found.as_ref().and_then(|(id, secret, active)| {
        let (salt, hash) = secret.split_once(':')?;
        (*active && accounts::verify_password(salt, hash, password)).then(|| id.clone())
    });
    let Some(user_id) = verified else {
        audit::record_quietly(
            conn,
            state.clock.now(),
            &audit::Entry {
                author: Some(&username),
                action_type: "Failed login",
                description: &format!("Failed login attempt for {username}"),
                method: Some(&req.method),
                severity: Severity::Security,
            },
        );
        return Err(err(
            &req.id,
            "invalid_credentials",
            "invalid username or password",
            None,
        ));
    };

    let row = load_user(conn, &user_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "user"))?;
    audit::record_quietly(
        conn,
        state.clock.now(),
        &audit::Entry {
            author: Some(&row.username),
            action_type: "Login",
            description: &format!("{} logged in", row.username),
            method: Some(&req.method),
            severity: Severity::Info,
        },
    );
    let body = user_json(&row);
    state.user = Some(session_from(&row));
    log::info!("event=session_start user={}", row.username);
    Ok(json!({ "user": body }))
}

fn handle_logout(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(user) = state.user.take() else {
        return Ok(json!({ "loggedOut": false }));
    };
    if let Some(conn) = state.db.as_ref() {
        audit::record_quietly(
            conn,
            state.clock.now(),
            &audit::Entry {
                author: Some(&user.username),
                action_type: "Logout",
                description: &format!("{} logged out", user.username),
                method: Some(&req.method),
                severity: Severity::Info,
            },
        );
    }
    log::info!("event=session_end user={}", user.username);
    Ok(json!({ "loggedOut": true }))
}

fn handle_whoami(state: &mut AppState, req: &Request) -> HandlerResult {
    let Some(session) = state.user.as_ref() else {
        return Ok(json!({ "user": null }));
    };
    let conn = db_conn(state, req)?;
    let row = load_user(conn, &session.id).map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({ "user": row.as_ref().map(user_json) }))
}

fn handle_list(state: &mut AppState, req: &Request) -> HandlerResult {
    require_staff(state, req)?;
    let conn = db_conn(state, req)?;
    let mut stmt = conn
        .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY username"))
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    let users = stmt
        .query_map([], user_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({ "users": users.iter().map(user_json).collect::<Vec<_>>() }))
}

fn handle_set_role(state: &mut AppState, req: &Request) -> HandlerResult {
    let actor = require_superuser(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let user_id = need_str(req, p, "userId")?;
    let staff = opt_bool(req, p, "staff")?;
    let superuser = opt_bool(req, p, "superuser")?;
    let active = opt_bool(req, p, "active")?;
    if user_id == actor.id && (superuser == Some(false) || active == Some(false)) {
        return Err(forbidden(req, "cannot demote or deactivate yourself"));
    }
    let mut row = load_user(conn, &user_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "user"))?;
    row.staff = staff.unwrap_or(row.staff);
    row.superuser = superuser.unwrap_or(row.superuser);
    row.active = active.unwrap_or(row.active);
    conn.execute(
        "UPDATE users SET is_staff = ?, is_superuser = ?, active = ?, updated_at = ? WHERE id = ?",
        params![
            row.staff as i64,
            row.superuser as i64,
            row.active as i64,
            fmt_date_time(state.clock.now()),
            user_id
        ],
    )
    .map_err(|e| db_err(req, "db_update_failed", e))?;
    audit::record_quietly(
        conn,
        state.clock.now(),
        &audit::Entry {
            author: Some(&actor.username),
            action_type: "Role change",
            description: &format!(
                "{}: staff={} superuser={} active={}",
                row.username, row.staff, row.superuser, row.active
            ),
            method: Some(&req.method),
            severity: Severity::Security,
        },
    );
    Ok(json!({ "user": user_json(&row) }))
}

fn count(conn: &Connection, sql: &str, user_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(sql, [user_id], |r| r.get(0))
}

fn handle_profile_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let me = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let p = params(req)?;
    let user_id = opt_str(req, p, "userId")?.unwrap_or_else(|| me.id.clone());
    if user_id != me.id && !me.staff && !me.superuser {
        return Err(forbidden(req, "you can only view your own profile"));
    }
    let row = load_user(conn, &user_id)
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .ok_or_else(|| not_found(req, "user"))?;
    let profile = conn
        .query_row(
            "SELECT institution, program, current_period, study_hours_per_day, preferred_method,
                    dark_theme, email_notifications, timezone
             FROM profiles WHERE user_id = ?",
            [&user_id],
            |r| {
                Ok(json!({
                    "institution": r.get::<_, String>(0)?,
                    "program": r.get::<_, String>(1)?,
                    "currentPeriod": r.get::<_, String>(2)?,
                    "studyHoursPerDay": r.get::<_, i64>(3)?,
                    "preferredMethod": r.get::<_, String>(4)?,
                    "darkTheme": r.get::<_, i64>(5)? != 0,
                    "emailNotifications": r.get::<_, i64>(6)? != 0,
                    "timezone": r.get::<_, String>(7)?,
                }))
            },
        )
        .optional()
        .map_err(|e| db_err(req, "db_query_failed", e))?
        .unwrap_or_else(|| {
            json!({
                "institution": "",
                "program": "",
                "currentPeriod": "",
                "studyHoursPerDay": 4,
                "preferredMethod": "",
                "darkTheme": true,
                "emailNotifications": true,
                "timezone": "America/Sao_Paulo",
            })
        });
    let stats = (|| -> rusqlite::Result<Value> {
        Ok(json!({
            "totalCourses": count(
                conn,
                "SELECT COUNT(*) FROM courses c JOIN semesters s ON s.id = c.semester_id
                 WHERE s.owner_id = ? AND c.active = 1",
                &user_id,
            )?,
            "totalEvents": count(
                conn,
                "SELECT COUNT(*) FROM calendar_events WHERE owner_id = ?",
                &user_id,
            )?,
            "completedTasks": count(
                conn,
                "SELECT COUNT(*) FROM tasks WHERE owner_id = ? AND status = 'DONE'",
                &user_id,
            )?,
        }))
    })()
    .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(json!({ "user": user_json(&row), "profile": profile, "stats": stats }))
}

const PROFILE_FIELDS: [&str; 8] = [
    "institution",
    "program",
    "currentPeriod",
    "studyHoursPerDay",
    "preferredMethod",
    "darkTheme",
    "emailNotifications",
    "timezone",
];

fn handle_profile_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let me = require_user(state, req)?;
    let conn = db_conn(state, req)?;
    let patch = object(req, params(req)?, "patch")?;
    only_keys(req, patch, &PROFILE_FIELDS)?;

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (key, column) in [
        ("institution", "institution"),
        ("program", "program"),
        ("currentPeriod", "current_period"),
        ("preferredMethod", "preferred_method"),
        ("timezone", "timezone"),
    ] {
        if patch.contains_key(key) {
            let v = opt_str(req, patch, key)?.unwrap_or_default();
            if key == "timezone" && v.is_empty() {
                return Err(validation(req, ValidationError::single(key, "timezone is required")));
            }
            sets.push(column);
            values.push(v.into());
        }
    }
    if let Some(hours) = opt_i64(req, patch, "studyHoursPerDay")? {
        if !(1..=24).contains(&hours) {
            return Err(validation(
                req,
                ValidationError::single("studyHoursPerDay", "must be between 1 and 24"),
            ));
        }
        sets.push("study_hours_per_day");
        values.push(hours.into());
    }
    for (key, column) in [
        ("darkTheme", "dark_theme"),
        ("emailNotifications", "email_notifications"),
    ] {
        if let Some(b) = opt_bool(req, patch, key)? {
            sets.push(column);
            values.push((b as i64).into());
        }
    }

    conn.execute(
        "INSERT INTO profiles(user_id, updated_at) VALUES(?, ?) ON CONFLICT(user_id) DO NOTHING",
        params![me.id, fmt_date_time(state.clock.now())],
    )
    .map_err(|e| db_err(req, "db_insert_failed", e))?;
    if !sets.is_empty() {
        let assignments: Vec<String> = sets.iter().map(|c| format!("{c} = ?")).collect();
        values.push(fmt_date_time(state.clock.now()).into());
        values.push(me.id.clone().into());
        conn.execute(
            &format!(
                "UPDATE profiles SET {}, updated_at = ? WHERE user_id = ?",
                assignments.join(", ")
            ),
            rusqlite::params_from_iter(values),
        )
        .map_err(|e| db_err(req, "db_update_failed", e))?;
    }
    handle_profile_get(state, req)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.register" => handle_register(state, req),
        "session.login" => handle_login(state, req),
        "session.logout" => handle_logout(state, req),
        "session.whoami" => handle_whoami(state, req),
        "users.list" => handle_list(state, req),
        "users.setRole" => handle_set_role(state, req),
        "users.profile.get" => handle_profile_get(state, req),
        "users.profile.update" => handle_profile_update(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
