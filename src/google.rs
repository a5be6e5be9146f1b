//! Offline Google Calendar import. The daemon never talks to Google itself;
//! a companion job drops the `events.list` response into the workspace and
//! `google.sync` loads it.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

use crate::clock::{parse_date, parse_date_time};

pub const FEED_FILE_NAME: &str = "google_calendar.json";
pub const CREDENTIALS_FILE_NAME: &str = "google_credentials.json";

#[derive(Debug, thiserror::Error)]
pub enum GoogleError {
    #[error("credentials file is not valid JSON")]
    CredentialsJson,
    #[error("credentials must belong to a service account (client_email and private_key)")]
    NotServiceAccount,
    #[error("calendar feed is not valid JSON: {0}")]
    FeedJson(String),
    #[error("calendar feed must be an object with an items array")]
    FeedShape,
    #[error("item {index}: {message}")]
    Item { index: usize, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoogleEvent {
    pub google_id: String,
    pub summary: String,
    pub description: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub all_day: bool,
}

/// `Ok(false)` when no credentials file exists; the import still runs.
pub fn check_credentials(workspace: &Path) -> Result<bool, GoogleError> {
    let path = workspace.join(CREDENTIALS_FILE_NAME);
    if !path.is_file() {
        return Ok(false);
    }
    let text = std::fs::read_to_string(&path)?;
    let v: Value = serde_json::from_str(&text).map_err(|_| GoogleError::CredentialsJson)?;
    let has = |k: &str| v.get(k).and_then(|x| x.as_str()).map(|s| !s.is_empty()).unwrap_or(false);
    if has("client_email") && has("private_key") {
        Ok(true)
    } else {
        Err(GoogleError::NotServiceAccount)
    }
}

pub fn read_feed(path: &Path) -> Result<Vec<GoogleEvent>, GoogleError> {
    let text = std::fs::read_to_string(path)?;
    let doc: Value =
        serde_json::from_str(&text).map_err(|e| GoogleError::FeedJson(e.to_string()))?;
    parse_feed(&doc)
}

fn parse_when(v: Option<&Value>) -> Option<(NaiveDateTime, bool)> {
    let v = v?;
    if let Some(raw) = v.get("dateTime").and_then(|x| x.as_str()) {
        // Keep the wall-clock time the calendar shows.
        let dt = DateTime::parse_from_rfc3339(raw)
            .map(|d| d.naive_local())
            .ok()
            .or_else(|| parse_date_time(raw))?;
        return Some((dt, false));
    }
    let raw = v.get("date").and_then(|x| x.as_str())?;
    parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)).map(|dt| (dt, true))
}

pub fn parse_feed(doc: &Value) -> Result<Vec<GoogleEvent>, GoogleError> {
    let items = doc
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or(GoogleError::FeedShape)?;
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if item.get("status").and_then(|v| v.as_str()) == Some("cancelled") {
            continue;
        }
        let google_id = item
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GoogleError::Item {
                index,
                message: "missing id".to_string(),
            })?;
        let (start, all_day) = parse_when(item.get("start")).ok_or_else(|| GoogleError::Item {
            index,
            message: "missing or invalid start".to_string(),
        })?;
        let end = parse_when(item.get("end"))
            .map(|(e, _)| e)
            .filter(|e| *e >= start)
            .unwrap_or(start);
        out.push(GoogleEvent {
            google_id: google_id.to_string(),
            summary: item
                .get("summary")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or("Google event")
                .to_string(),
            description: item
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            start,
            end,
            all_day,
        });
    }
    Ok(out)
}
