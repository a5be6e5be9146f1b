use chrono::NaiveTime;
use sha2::{Digest, Sha256};

/// Longest a single class slot may run.
pub const MAX_SLOT_MINUTES: i64 = 8 * 60;

#[derive(Debug, Clone)]
pub struct SlotWindow {
    pub id: String,
    pub weekday: u32,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

pub fn overlaps(
    a_start: NaiveTime,
    a_end: NaiveTime,
    b_start: NaiveTime,
    b_end: NaiveTime,
) -> bool {
    a_start < b_end && a_end > b_start
}

/// First existing slot on the same weekday whose time range intersects the
/// candidate. `exclude` skips the slot being edited.
pub fn find_conflict<'a>(
    candidate: &SlotWindow,
    existing: &'a [SlotWindow],
    exclude: Option<&str>,
) -> Option<&'a SlotWindow> {
    existing.iter().find(|other| {
        Some(other.id.as_str()) != exclude
            && other.weekday == candidate.weekday
            && overlaps(candidate.start, candidate.end, other.start, other.end)
    })
}

/// Checks a slot's own fields; returns (field, message) pairs.
pub fn validate_window(
    weekday: i64,
    start: NaiveTime,
    end: NaiveTime,
) -> Vec<(&'static str, String)> {
    let mut out = Vec::new();
    if !(0..=6).contains(&weekday) {
        out.push(("weekday", "weekday must be 0 (Monday) to 6 (Sunday)".to_string()));
    }
    if end <= start {
        out.push(("endTime", "end time must be after start time".to_string()));
    } else if (end - start).num_minutes() > MAX_SLOT_MINUTES {
        out.push(("endTime", "a class slot cannot be longer than 8 hours".to_string()));
    }
    out
}

/// `1h30min`, `2h`, `45min`.
pub fn duration_label(start: NaiveTime, end: NaiveTime) -> String {
    let minutes = (end - start).num_minutes().max(0);
    let (h, m) = (minutes / 60, minutes % 60);
    match (h, m) {
        (0, m) => format!("{m}min"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h{m}min"),
    }
}

/// Stable per-course color: the first three digest bytes as `#rrggbb`.
pub fn course_color(course_name: &str) -> String {
    let digest = Sha256::digest(course_name.as_bytes());
    format!("#{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2])
}
