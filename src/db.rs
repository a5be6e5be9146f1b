use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "studyd.sqlite3";
pub const MATERIALS_DIR: &str = "materials";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    std::fs::create_dir_all(workspace.join(MATERIALS_DIR))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    migrate(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL DEFAULT '',
            password_salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            is_staff INTEGER NOT NULL DEFAULT 0,
            is_superuser INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles(
            user_id TEXT PRIMARY KEY,
            institution TEXT NOT NULL DEFAULT '',
            program TEXT NOT NULL DEFAULT '',
            current_period TEXT NOT NULL DEFAULT '',
            study_hours_per_day INTEGER NOT NULL DEFAULT 4,
            preferred_method TEXT NOT NULL DEFAULT '',
            dark_theme INTEGER NOT NULL DEFAULT 1,
            email_notifications INTEGER NOT NULL DEFAULT 1,
            timezone TEXT NOT NULL DEFAULT 'America/Sao_Paulo',
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            year INTEGER NOT NULL,
            period TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(owner_id) REFERENCES users(id),
            UNIQUE(owner_id, year, period)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            semester_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            slug TEXT NOT NULL UNIQUE,
            access_count INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(semester_id) REFERENCES semesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_semester ON courses(semester_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_accesses(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            user_id TEXT,
            accessed_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_accesses_course ON course_accesses(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_slots(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            weekday INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            location TEXT NOT NULL DEFAULT '',
            notes TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, weekday, start_time)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_slots_course ON schedule_slots(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS materials(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            stored_path TEXT NOT NULL,
            original_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            uploaded_at TEXT NOT NULL,
            uploader_id TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_materials_course ON materials(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tasks(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            deadline TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(owner_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_course ON tasks(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS agenda_events(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            scope TEXT NOT NULL,
            kind TEXT NOT NULL,
            start_at TEXT NOT NULL,
            end_at TEXT,
            semester_id TEXT,
            course_id TEXT,
            owner_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(owner_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_agenda_events_start ON agenda_events(start_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calendar_events(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            kind TEXT NOT NULL,
            course_id TEXT,
            custom_color TEXT,
            reminder INTEGER NOT NULL DEFAULT 1,
            reminder_minutes INTEGER NOT NULL DEFAULT 30,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(owner_id) REFERENCES users(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calendar_events_owner_start ON calendar_events(owner_id, start_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calendar_events_kind ON calendar_events(kind)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS calendar_recurrences(
            event_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            until_date TEXT,
            interval_n INTEGER NOT NULL DEFAULT 1,
            weekdays TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(event_id) REFERENCES calendar_events(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_actions(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            author TEXT,
            action_type TEXT NOT NULL,
            description TEXT NOT NULL,
            date TEXT NOT NULL,
            time TEXT NOT NULL,
            method TEXT,
            severity TEXT NOT NULL DEFAULT 'info'
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_actions_date ON audit_actions(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_actions_severity ON audit_actions(severity)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lab_events(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            kind TEXT NOT NULL,
            created_by TEXT,
            approved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lab_events_start ON lab_events(start_at)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lab_event_participants(
            event_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY(event_id, user_id),
            FOREIGN KEY(event_id) REFERENCES lab_events(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lab_hours(
            weekday INTEGER PRIMARY KEY,
            opening_time TEXT,
            closing_time TEXT,
            closed INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            recipient TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            event_id TEXT,
            created_at TEXT NOT NULL,
            sent INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS google_events(
            google_id TEXT PRIMARY KEY,
            summary TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            all_day INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_google_events_start ON google_events(start_at)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
