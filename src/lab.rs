//! Lab scheduling rules: opening hours, availability conflicts, visit
//! request text and the notification templates queued on state changes.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::calendar::weekday_name;

pub const EVENT_KINDS: [&str; 5] = ["internal", "workshop", "visit", "maintenance", "other"];

pub fn is_event_kind(kind: &str) -> bool {
    EVENT_KINDS.contains(&kind)
}

pub fn event_kind_label(kind: &str) -> &'static str {
    match kind {
        "internal" => "Internal event",
        "workshop" => "Workshop",
        "visit" => "Scheduled visit",
        "maintenance" => "Maintenance",
        "google" => "Google Calendar",
        _ => "Other",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpeningHours {
    /// 0 = Monday .. 6 = Sunday.
    pub weekday: u32,
    pub opening: Option<NaiveTime>,
    pub closing: Option<NaiveTime>,
    pub closed: bool,
}

impl OpeningHours {
    pub fn label(&self) -> String {
        match (self.closed, self.opening, self.closing) {
            (false, Some(o), Some(c)) => format!(
                "{}: {} - {}",
                weekday_name(self.weekday),
                crate::clock::fmt_time(o),
                crate::clock::fmt_time(c)
            ),
            _ => format!("{}: Closed", weekday_name(self.weekday)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Booking {
    pub id: String,
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Closed,
    OutsideHours,
    Overlap,
    NoHours,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub kind: ConflictKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Every reason the lab cannot host `[start, end)`. An empty list means the
/// slot is free. `hours` is the full weekly table; `bookings` should already
/// exclude the event being edited.
pub fn conflicts(
    start: NaiveDateTime,
    end: NaiveDateTime,
    hours: &[OpeningHours],
    bookings: &[Booking],
) -> Vec<Conflict> {
    let mut out = Vec::new();
    let weekday = start.date().weekday().num_days_from_monday();
    match hours.iter().find(|h| h.weekday == weekday) {
        None => out.push(Conflict {
            kind: ConflictKind::NoHours,
            message: format!("no opening hours configured for {}", weekday_name(weekday)),
            event_id: None,
        }),
        Some(h) if h.closed => out.push(Conflict {
            kind: ConflictKind::Closed,
            message: format!("the lab is closed on {}", weekday_name(weekday)),
            event_id: None,
        }),
        Some(h) => {
            let within = match (h.opening, h.closing) {
                (Some(o), Some(c)) => {
                    end.date() == start.date() && start.time() >= o && end.time() <= c
                }
                _ => false,
            };
            if !within {
                out.push(Conflict {
                    kind: ConflictKind::OutsideHours,
                    message: format!("outside opening hours ({})", h.label()),
                    event_id: None,
                });
            }
        }
    }
    for b in bookings {
        if start < b.end && end > b.start {
            let what = if b.approved { "event" } else { "pending request" };
            out.push(Conflict {
                kind: ConflictKind::Overlap,
                message: format!(
                    "overlaps {what} \"{}\" ({} - {})",
                    b.title,
                    b.start.format("%d/%m %H:%M"),
                    b.end.format("%H:%M")
                ),
                event_id: Some(b.id.clone()),
            });
        }
    }
    out
}

/// Canned rejection reasons offered to staff.
pub const REJECT_REASONS: [(&str, &str); 6] = [
    (
        "date_unavailable",
        "The requested date/time is already booked for another event",
    ),
    (
        "outside_hours",
        "The request falls outside the lab's opening hours",
    ),
    (
        "max_capacity",
        "The number of visitors exceeds our maximum capacity",
    ),
    (
        "maintenance",
        "The lab will be under maintenance on the requested date",
    ),
    (
        "missing_details",
        "The request does not contain enough details for evaluation",
    ),
    ("other", "Other reason"),
];

pub fn reject_reason_text(code: &str) -> Option<&'static str> {
    REJECT_REASONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, text)| *text)
}

#[derive(Debug, Clone)]
pub struct VisitRequest {
    pub visitor_name: String,
    pub visitor_email: String,
    pub visitor_phone: String,
    pub visitors: i64,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub details: String,
}

impl VisitRequest {
    pub fn description(&self) -> String {
        format!(
            "Requester: {}\nEmail: {}\nPhone: {}\nNumber of visitors: {}\nVisit date: {}\nTime: {} - {}\n\nAdditional details:\n{}",
            self.visitor_name,
            self.visitor_email,
            self.visitor_phone,
            self.visitors,
            self.date.format("%d/%m/%Y"),
            crate::clock::fmt_time(self.start),
            crate::clock::fmt_time(self.end),
            self.details
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    VisitSubmitted,
    VisitApproved,
    VisitRejected,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VisitSubmitted => "visit_submitted",
            Self::VisitApproved => "visit_approved",
            Self::VisitRejected => "visit_rejected",
        }
    }
}

pub struct Message {
    pub subject: String,
    pub body: String,
}

pub fn compose(
    kind: NotificationKind,
    title: &str,
    start: NaiveDateTime,
    end: NaiveDateTime,
    reason: Option<&str>,
) -> Message {
    let when = format!(
        "{} from {} to {}",
        start.format("%d/%m/%Y"),
        start.format("%H:%M"),
        end.format("%H:%M")
    );
    match kind {
        NotificationKind::VisitSubmitted => Message {
            subject: format!("Visit request received: {title}"),
            body: format!(
                "Your request \"{title}\" for {when} was received and is awaiting approval."
            ),
        },
        NotificationKind::VisitApproved => Message {
            subject: format!("Visit request approved: {title}"),
            body: format!("Your request \"{title}\" for {when} was approved. See you then!"),
        },
        NotificationKind::VisitRejected => Message {
            subject: format!("Visit request declined: {title}"),
            body: format!(
                "Your request \"{title}\" for {when} could not be accepted.\n\nReason: {}",
                reason.unwrap_or("not specified")
            ),
        },
    }
}

/// Pulls the requester address back out of a composed visit description.
pub fn contact_from_description(description: &str) -> Option<String> {
    description
        .lines()
        .find_map(|l| l.strip_prefix("Email: "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
