use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Calendar,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "calendar" => Some(Self::Calendar),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Calendar => "setup.calendar",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
        }
    }
}

const ALL_SECTIONS: [SetupSection; 1] = [SetupSection::Calendar];

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Calendar => json!({
            "weekStartHour": 7,
            "weekEndHour": 22,
            "defaultReminderMinutes": 30,
            "maxEventHours": 12,
            "upcomingDays": 7
        }),
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Calendar => {
                let n = match k.as_str() {
                    "weekStartHour" => parse_i64_range(v, k, 0, 23)?,
                    "weekEndHour" => parse_i64_range(v, k, 1, 24)?,
                    "defaultReminderMinutes" => parse_i64_range(v, k, 5, 1440)?,
                    "maxEventHours" => parse_i64_range(v, k, 1, 24)?,
                    "upcomingDays" => parse_i64_range(v, k, 1, 60)?,
                    _ => return Err(format!("unknown calendar field: {}", k)),
                };
                obj.insert(k.clone(), json!(n));
            }
        }
    }
    let start = obj.get("weekStartHour").and_then(|v| v.as_i64()).unwrap_or(7);
    let end = obj.get("weekEndHour").and_then(|v| v.as_i64()).unwrap_or(22);
    if start >= end {
        return Err("weekStartHour must be before weekEndHour".to_string());
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let mut merged = current.clone();
            if merge_section_patch(section, &mut merged, saved_obj).is_ok() {
                current = merged;
            }
        }
    }
    Ok(current)
}

/// Typed view of the `calendar` setup section.
#[derive(Debug, Clone, Copy)]
pub struct CalendarSettings {
    pub week_start_hour: u32,
    pub week_end_hour: u32,
    pub default_reminder_minutes: i64,
    pub max_event_hours: i64,
    pub upcoming_days: i64,
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            week_start_hour: 7,
            week_end_hour: 22,
            default_reminder_minutes: 30,
            max_event_hours: 12,
            upcoming_days: 7,
        }
    }
}

pub fn calendar_settings(conn: &Connection) -> CalendarSettings {
    let d = CalendarSettings::default();
    let Ok(v) = load_section(conn, SetupSection::Calendar) else {
        return d;
    };
    let get = |k: &str| v.get(k).and_then(|x| x.as_i64());
    CalendarSettings {
        week_start_hour: get("weekStartHour").map(|n| n as u32).unwrap_or(d.week_start_hour),
        week_end_hour: get("weekEndHour").map(|n| n as u32).unwrap_or(d.week_end_hour),
        default_reminder_minutes: get("defaultReminderMinutes")
            .unwrap_or(d.default_reminder_minutes),
        max_event_hours: get("maxEventHours").unwrap_or(d.max_event_hours),
        upcoming_days: get("upcomingDays").unwrap_or(d.upcoming_days),
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sections: Vec<SetupSection> = match req.params.get("section").and_then(|v| v.as_str()) {
        None => ALL_SECTIONS.to_vec(),
        Some(raw) => match SetupSection::parse(raw) {
            Some(s) => vec![s],
            None => return err(&req.id, "bad_params", "unknown section", None),
        },
    };
    let mut out = Map::new();
    for section in sections {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    let mut out = Map::new();
    out.insert(section.name().to_string(), current);
    ok(&req.id, Value::Object(out))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
