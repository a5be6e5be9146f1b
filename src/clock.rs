use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const DATE_TIME_FMT: &str = "%Y-%m-%dT%H:%M:%S";
pub const TIME_FMT: &str = "%H:%M";

/// Source of "now" for every handler. A fixed instant makes the daemon
/// deterministic (tests, demos); otherwise local wall-clock time is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock {
    fixed: Option<NaiveDateTime>,
}

impl Clock {
    pub fn system() -> Self {
        Self { fixed: None }
    }

    pub fn fixed(at: NaiveDateTime) -> Self {
        Self { fixed: Some(at) }
    }

    pub fn now(&self) -> NaiveDateTime {
        match self.fixed {
            Some(at) => at,
            None => {
                let now = Local::now().naive_local();
                now.with_nanosecond(0).unwrap_or(now)
            }
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FMT).ok()
}

/// Accepts `YYYY-MM-DDTHH:MM[:SS]` and the space-separated variant.
pub fn parse_date_time(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(v) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(v);
        }
    }
    None
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .ok()
}

pub fn fmt_date(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

pub fn fmt_date_time(dt: NaiveDateTime) -> String {
    dt.format(DATE_TIME_FMT).to_string()
}

pub fn fmt_time(t: NaiveTime) -> String {
    t.format(TIME_FMT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minute_and_second_precision() {
        let a = parse_date_time("2026-03-02T09:30").expect("minute precision");
        let b = parse_date_time("2026-03-02 09:30:00").expect("space separated");
        assert_eq!(a, b);
        assert_eq!(fmt_date_time(a), "2026-03-02T09:30:00");
    }

    #[test]
    fn fixed_clock_is_stable() {
        let at = parse_date_time("2026-10-16T08:00").expect("dt");
        let clock = Clock::fixed(at);
        assert_eq!(clock.now(), at);
        assert_eq!(fmt_date(clock.today()), "2026-10-16");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_date("16/10/2026").is_none());
        assert!(parse_time("25:00").is_none());
        assert_eq!(parse_time("07:05").map(fmt_time).as_deref(), Some("07:05"));
    }
}
