use chrono::NaiveDateTime;
use rusqlite::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Security,
    Error,
    Critical,
}

impl Severity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "security" => Some(Self::Security),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Security => "security",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    pub fn css_class(self) -> &'static str {
        match self {
            Self::Info => "primary",
            Self::Warning => "warning",
            Self::Error | Self::Critical => "danger",
            Self::Security => "dark",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

/// Worst severity in a set; `Info` when empty. Ordering is
/// critical > error > security > warning > info.
pub fn max_severity<I: IntoIterator<Item = Severity>>(items: I) -> Severity {
    items.into_iter().max().unwrap_or(Severity::Info)
}

pub struct Entry<'a> {
    pub author: Option<&'a str>,
    pub action_type: &'a str,
    pub description: &'a str,
    pub method: Option<&'a str>,
    pub severity: Severity,
}

pub fn record(conn: &Connection, at: NaiveDateTime, entry: &Entry<'_>) -> anyhow::Result<()> {
    let author = entry
        .author
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("System");
    conn.execute(
        "INSERT INTO audit_actions(author, action_type, description, date, time, method, severity)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            author,
            entry.action_type,
            entry.description,
            at.format(crate::clock::DATE_FMT).to_string(),
            at.format("%H:%M:%S").to_string(),
            entry.method,
            entry.severity.as_str(),
        ),
    )?;
    Ok(())
}

/// Writes an entry, logging instead of failing when the insert breaks.
pub fn record_quietly(conn: &Connection, at: NaiveDateTime, entry: &Entry<'_>) {
    if let Err(e) = record(conn, at, entry) {
        log::warn!(
            "event=audit_write_failed type={} err={e:#}",
            entry.action_type
        );
    }
}
