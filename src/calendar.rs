//! Calendar arithmetic shared by the calendar, agenda and lab handlers:
//! month grids, recurrence expansion and the virtual events generated from
//! weekly class slots.

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

/// Hard cap on occurrences returned for a single event in one query.
pub const MAX_OCCURRENCES: usize = 1000;
const MAX_STEPS: usize = 100_000;

pub const SLOT_EVENT_COLOR: &str = "#28a745";

pub const MONTH_NAMES_EN: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

pub const MONTH_NAMES_PT: [&str; 12] = [
    "Janeiro",
    "Fevereiro",
    "Março",
    "Abril",
    "Maio",
    "Junho",
    "Julho",
    "Agosto",
    "Setembro",
    "Outubro",
    "Novembro",
    "Dezembro",
];

pub const WEEKDAY_LABELS_SUN_FIRST: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

pub const WEEKDAY_NAMES_MON_FIRST: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

pub fn month_name_en(month: u32) -> &'static str {
    MONTH_NAMES_EN[((month.clamp(1, 12)) - 1) as usize]
}

pub fn month_name_pt(month: u32) -> &'static str {
    MONTH_NAMES_PT[((month.clamp(1, 12)) - 1) as usize]
}

pub fn weekday_name(weekday_mon0: u32) -> &'static str {
    WEEKDAY_NAMES_MON_FIRST[(weekday_mon0.min(6)) as usize]
}

pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = first.checked_add_months(Months::new(1))?;
    Some((first, next - Duration::days(1)))
}

pub fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month <= 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

pub fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Pulls a month that ran one step past either end back into range:
/// 0 becomes December of the previous year, 13 January of the next.
pub fn normalize_month(year: i32, month: i32) -> (i32, u32) {
    if month < 1 {
        (year - 1, 12)
    } else if month > 12 {
        (year + 1, 1)
    } else {
        (year, month as u32)
    }
}

/// Sunday-first week rows for a month; days outside the month are 0.
pub fn month_weeks(year: i32, month: u32) -> Vec<[u32; 7]> {
    let Some((first, last)) = month_bounds(year, month) else {
        return Vec::new();
    };
    let offset = first.weekday().num_days_from_sunday() as usize;
    let mut weeks = Vec::new();
    let mut row = [0u32; 7];
    let mut col = offset;
    for day in 1..=last.day() {
        row[col] = day;
        col += 1;
        if col == 7 {
            weeks.push(row);
            row = [0u32; 7];
            col = 0;
        }
    }
    if col > 0 {
        weeks.push(row);
    }
    weeks
}

/// The seven dates of the first grid row of a month, starting on the
/// Sunday on or before the 1st.
pub fn first_week_dates(year: i32, month: u32) -> Vec<NaiveDate> {
    let Some((first, _)) = month_bounds(year, month) else {
        return Vec::new();
    };
    let start = first - Duration::days(first.weekday().num_days_from_sunday() as i64);
    (0..7).map(|i| start + Duration::days(i)).collect()
}

/// Monday..Sunday around `day`.
pub fn iso_week_bounds(day: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = day - Duration::days(day.weekday().num_days_from_monday() as i64);
    (start, start + Duration::days(6))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Today,
    Week,
    Month,
    Custom,
}

impl Period {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "today" => Some(Self::Today),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Inclusive date window, or `None` when a custom range is incomplete
    /// (no date filtering is applied then).
    pub fn window(
        self,
        today: NaiveDate,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Option<(NaiveDate, NaiveDate)> {
        match self {
            Self::Today => Some((today, today)),
            Self::Week => Some(iso_week_bounds(today)),
            Self::Month => month_bounds(today.year(), today.month()),
            Self::Custom => match (from, to) {
                (Some(a), Some(b)) => Some((a, b)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Yearly,
}

impl RecurrenceKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "biweekly" => Some(Self::Biweekly),
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Biweekly => "biweekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    fn uses_weekdays(self) -> bool {
        matches!(self, Self::Weekly | Self::Biweekly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    pub kind: RecurrenceKind,
    pub interval: u32,
    pub until: Option<NaiveDate>,
    /// ISO weekdays, 1 = Monday .. 7 = Sunday; sorted and unique.
    pub weekdays: Vec<u32>,
}

/// Parses `"1,3,5"` into sorted unique ISO weekdays.
pub fn parse_weekdays(raw: &str) -> Result<Vec<u32>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for part in trimmed.split(',') {
        let d: u32 = part
            .trim()
            .parse()
            .map_err(|_| "use numbers 1 to 7 separated by commas (e.g. 1,3,5)".to_string())?;
        if !(1..=7).contains(&d) {
            return Err("use numbers 1 to 7 separated by commas (e.g. 1,3,5)".to_string());
        }
        out.push(d);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

pub fn weekdays_csv(days: &[u32]) -> String {
    days.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl Recurrence {
    pub fn new(
        kind: RecurrenceKind,
        interval: u32,
        until: Option<NaiveDate>,
        weekdays: Vec<u32>,
    ) -> Result<Self, String> {
        if !(1..=52).contains(&interval) {
            return Err("interval must be between 1 and 52".to_string());
        }
        let weekdays = if kind.uses_weekdays() { weekdays } else { Vec::new() };
        Ok(Self {
            kind,
            interval,
            until,
            weekdays,
        })
    }

    /// Occurrence starts of a series beginning at `first`, restricted to
    /// `[window_start, window_end)`. The first start is occurrence zero.
    pub fn occurrences(
        &self,
        first: NaiveDateTime,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
    ) -> Vec<NaiveDateTime> {
        let mut out = Vec::new();
        if window_end <= window_start {
            return out;
        }
        if self.kind.uses_weekdays() && !self.weekdays.is_empty() {
            self.weekday_occurrences(first, window_start, window_end, &mut out);
            return out;
        }

        for n in 0..MAX_STEPS {
            let Some(candidate) = self.nth_simple(first, n as u32) else {
                break;
            };
            if self.past_until(candidate) || candidate >= window_end {
                break;
            }
            if candidate >= window_start {
                out.push(candidate);
                if out.len() >= MAX_OCCURRENCES {
                    break;
                }
            }
        }
        out
    }

    fn past_until(&self, candidate: NaiveDateTime) -> bool {
        self.until.map(|u| candidate.date() > u).unwrap_or(false)
    }

    fn week_step(&self) -> i64 {
        match self.kind {
            RecurrenceKind::Biweekly => 2 * self.interval as i64,
            _ => self.interval as i64,
        }
    }

    fn nth_simple(&self, first: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
        let steps = n.checked_mul(self.interval)?;
        match self.kind {
            RecurrenceKind::Daily => first.checked_add_signed(Duration::days(steps as i64)),
            RecurrenceKind::Weekly | RecurrenceKind::Biweekly => {
                let weeks = (n as i64) * self.week_step();
                first.checked_add_signed(Duration::weeks(weeks))
            }
            RecurrenceKind::Monthly => first
                .date()
                .checked_add_months(Months::new(steps))
                .map(|d| d.and_time(first.time())),
            RecurrenceKind::Yearly => first
                .date()
                .checked_add_months(Months::new(steps.checked_mul(12)?))
                .map(|d| d.and_time(first.time())),
        }
    }

    fn weekday_occurrences(
        &self,
        first: NaiveDateTime,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
        out: &mut Vec<NaiveDateTime>,
    ) {
        let time: NaiveTime = first.time();
        let week_anchor =
            first.date() - Duration::days(first.date().weekday().num_days_from_monday() as i64);
        let step = self.week_step();
        for w in 0..MAX_STEPS as i64 {
            let monday = week_anchor + Duration::weeks(w * step);
            if monday.and_time(time) >= window_end {
                return;
            }
            for d in &self.weekdays {
                let date = monday + Duration::days((*d as i64) - 1);
                let candidate = date.and_time(time);
                if candidate < first {
                    continue;
                }
                if self.past_until(candidate) || candidate >= window_end {
                    return;
                }
                if candidate >= window_start {
                    out.push(candidate);
                    if out.len() >= MAX_OCCURRENCES {
                        return;
                    }
                }
            }
        }
    }
}

/// One concrete item on a calendar: a stored event, one expansion of a
/// recurring event, a class-slot projection or an external event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub id: String,
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(serialize_with = "ser_dt")]
    pub start: NaiveDateTime,
    #[serde(serialize_with = "ser_dt")]
    pub end: NaiveDateTime,
    pub kind: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    pub location: String,
    pub is_fixed_slot: bool,
}

fn ser_dt<S: serde::Serializer>(dt: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&crate::clock::fmt_date_time(*dt))
}

#[derive(Debug, Clone)]
pub struct ClassSlot {
    pub slot_id: String,
    pub course_id: String,
    pub course_name: String,
    /// 0 = Monday .. 6 = Sunday.
    pub weekday: u32,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub location: String,
    pub notes: String,
}

/// Projects weekly class slots onto every matching day of `[from, to]`.
pub fn slot_occurrences(slots: &[ClassSlot], from: NaiveDate, to: NaiveDate) -> Vec<Occurrence> {
    let mut out = Vec::new();
    let mut day = from;
    while day <= to {
        let weekday = day.weekday().num_days_from_monday();
        for slot in slots.iter().filter(|s| s.weekday == weekday) {
            let description = if slot.location.is_empty() {
                "Regular class".to_string()
            } else {
                format!("Regular class - {}", slot.location)
            };
            out.push(Occurrence {
                id: format!("slot_{}_{}", slot.slot_id, crate::clock::fmt_date(day)),
                source: "slot",
                event_id: None,
                title: slot.course_name.clone(),
                description,
                start: day.and_time(slot.start),
                end: day.and_time(slot.end),
                kind: "CLASS".to_string(),
                color: SLOT_EVENT_COLOR.to_string(),
                course_id: Some(slot.course_id.clone()),
                course_name: Some(slot.course_name.clone()),
                location: slot.location.clone(),
                is_fixed_slot: true,
            });
        }
        let Some(next) = day.succ_opt() else {
            break;
        };
        day = next;
    }
    out
}

/// Next `limit` dates from `today` (inclusive, scanning 60 days) falling on
/// one of the given Monday-based weekdays.
pub fn upcoming_dates_on_weekdays(
    today: NaiveDate,
    weekdays: &[u32],
    limit: usize,
) -> Vec<NaiveDate> {
    if weekdays.is_empty() || limit == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for i in 0..60 {
        let d = today + Duration::days(i);
        if weekdays.contains(&d.weekday().num_days_from_monday()) {
            out.push(d);
            if out.len() >= limit {
                break;
            }
        }
    }
    out
}

pub fn calendar_kind_color(kind: &str) -> &'static str {
    match kind {
        "exam" => "#DC3545",
        "class" => "#28A745",
        "assignment" => "#FFC107",
        "study" => "#007BFF",
        "meeting" => "#6F42C1",
        _ => "#FF7A00",
    }
}

pub fn duration_hours(start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    let secs = (end - start).num_seconds() as f64;
    (secs / 3600.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{parse_date, parse_date_time};

    fn dt(s: &str) -> NaiveDateTime {
        parse_date_time(s).expect("datetime")
    }

    fn d(s: &str) -> NaiveDate {
        parse_date(s).expect("date")
    }

    #[test]
    fn month_grid_is_sunday_first_with_padding() {
        // October 2026 starts on a Thursday.
        let weeks = month_weeks(2026, 10);
        assert_eq!(weeks[0], [0, 0, 0, 0, 1, 2, 3]);
        assert_eq!(weeks.last().copied(), Some([25, 26, 27, 28, 29, 30, 31]));
        assert_eq!(weeks.len(), 5);
        // February 2026 starts on a Sunday and fills exactly four rows.
        assert_eq!(month_weeks(2026, 2).len(), 4);
    }

    #[test]
    fn first_week_starts_on_sunday_before_the_first() {
        let dates = first_week_dates(2026, 10);
        assert_eq!(dates[0], d("2026-09-27"));
        assert_eq!(dates[6], d("2026-10-03"));
    }

    #[test]
    fn month_navigation_wraps_years() {
        assert_eq!(prev_month(2026, 1), (2025, 12));
        assert_eq!(next_month(2026, 12), (2027, 1));
        assert_eq!(normalize_month(2026, 0), (2025, 12));
        assert_eq!(normalize_month(2026, 13), (2027, 1));
        assert_eq!(normalize_month(2026, 5), (2026, 5));
    }

    #[test]
    fn weekly_recurrence_with_weekdays_skips_days_before_first() {
        // Wednesday start, repeat Mon/Wed/Fri.
        let r = Recurrence::new(RecurrenceKind::Weekly, 1, None, vec![1, 3, 5]).expect("rule");
        let got = r.occurrences(
            dt("2026-10-14T10:00"),
            dt("2026-10-01T00:00"),
            dt("2026-10-24T00:00"),
        );
        let days: Vec<String> = got.iter().map(|x| x.format("%m-%d").to_string()).collect();
        assert_eq!(days, vec!["10-14", "10-16", "10-19", "10-21", "10-23"]);
    }

    #[test]
    fn biweekly_doubles_the_step() {
        let r = Recurrence::new(RecurrenceKind::Biweekly, 1, None, vec![]).expect("rule");
        let got = r.occurrences(
            dt("2026-10-01T08:00"),
            dt("2026-10-01T00:00"),
            dt("2026-11-01T00:00"),
        );
        assert_eq!(
            got,
            vec![dt("2026-10-01T08:00"), dt("2026-10-15T08:00"), dt("2026-10-29T08:00")]
        );
    }

    #[test]
    fn monthly_clamps_to_short_months_without_drifting() {
        let r = Recurrence::new(RecurrenceKind::Monthly, 1, None, vec![]).expect("rule");
        let got = r.occurrences(
            dt("2026-01-31T09:00"),
            dt("2026-01-01T00:00"),
            dt("2026-04-01T00:00"),
        );
        assert_eq!(
            got,
            vec![dt("2026-01-31T09:00"), dt("2026-02-28T09:00"), dt("2026-03-31T09:00")]
        );
    }

    #[test]
    fn yearly_leap_day_clamps() {
        let r = Recurrence::new(RecurrenceKind::Yearly, 1, None, vec![]).expect("rule");
        let got = r.occurrences(
            dt("2028-02-29T12:00"),
            dt("2029-01-01T00:00"),
            dt("2030-01-01T00:00"),
        );
        assert_eq!(got, vec![dt("2029-02-28T12:00")]);
    }

    #[test]
    fn until_is_inclusive_and_caps_daily_series() {
        let r = Recurrence::new(RecurrenceKind::Daily, 2, Some(d("2026-10-05")), vec![])
            .expect("rule");
        let got = r.occurrences(
            dt("2026-10-01T07:00"),
            dt("2026-09-01T00:00"),
            dt("2026-12-01T00:00"),
        );
        assert_eq!(
            got,
            vec![dt("2026-10-01T07:00"), dt("2026-10-03T07:00"), dt("2026-10-05T07:00")]
        );

        let endless = Recurrence::new(RecurrenceKind::Daily, 1, None, vec![]).expect("rule");
        let many = endless.occurrences(
            dt("2020-01-01T07:00"),
            dt("2020-01-01T00:00"),
            dt("2030-01-01T00:00"),
        );
        assert_eq!(many.len(), MAX_OCCURRENCES);
    }

    #[test]
    fn interval_and_weekday_parsing() {
        assert!(Recurrence::new(RecurrenceKind::Daily, 0, None, vec![]).is_err());
        assert!(Recurrence::new(RecurrenceKind::Daily, 53, None, vec![]).is_err());
        assert_eq!(parse_weekdays("5, 1,3,1").expect("parse"), vec![1, 3, 5]);
        assert!(parse_weekdays("0,2").is_err());
        assert!(parse_weekdays("mon").is_err());
        assert_eq!(weekdays_csv(&[1, 3, 5]), "1,3,5");
    }

    #[test]
    fn slot_projection_matches_weekdays() {
        let slots = vec![ClassSlot {
            slot_id: "s1".into(),
            course_id: "c1".into(),
            course_name: "Calculus".into(),
            weekday: 0,
            start: NaiveTime::from_hms_opt(8, 0, 0).expect("t"),
            end: NaiveTime::from_hms_opt(10, 0, 0).expect("t"),
            location: "Room 201".into(),
            notes: String::new(),
        }];
        let got = slot_occurrences(&slots, d("2026-10-01"), d("2026-10-31"));
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].id, "slot_s1_2026-10-05");
        assert_eq!(got[0].description, "Regular class - Room 201");
        assert!(got.iter().all(|o| o.is_fixed_slot && o.color == SLOT_EVENT_COLOR));
    }

    #[test]
    fn upcoming_dates_follow_weekdays() {
        // 2026-10-16 is a Friday.
        let got = upcoming_dates_on_weekdays(d("2026-10-16"), &[0, 4], 3);
        assert_eq!(got, vec![d("2026-10-16"), d("2026-10-19"), d("2026-10-23")]);
        assert!(upcoming_dates_on_weekdays(d("2026-10-16"), &[], 3).is_empty());
    }

    #[test]
    fn period_windows() {
        let today = d("2026-10-16");
        assert_eq!(
            Period::Week.window(today, None, None),
            Some((d("2026-10-12"), d("2026-10-18")))
        );
        assert_eq!(
            Period::Month.window(today, None, None),
            Some((d("2026-10-01"), d("2026-10-31")))
        );
        assert_eq!(Period::Custom.window(today, Some(today), None), None);
    }

    #[test]
    fn colors_and_durations() {
        assert_eq!(calendar_kind_color("exam"), "#DC3545");
        assert_eq!(calendar_kind_color("whatever"), "#FF7A00");
        assert_eq!(duration_hours(dt("2026-10-16T08:00"), dt("2026-10-16T09:20")), 1.33);
    }
}
