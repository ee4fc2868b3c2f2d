use chrono::{DateTime, Duration, NaiveTime, Utc};

/// Contract with the astronomical twilight provider: for any instant it
/// returns the active window (start, end) of the night containing that
/// instant. The computation itself lives outside this crate.
pub trait SunSchedule: Send + Sync {
    fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>);
}

/// Fixed clock-time window, optionally spanning midnight. Used when no
/// astronomical provider is wired in, and as the test schedule.
pub struct FixedWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl FixedWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self {
            start: NaiveTime::parse_from_str(start, "%H:%M").ok()?,
            end: NaiveTime::parse_from_str(end, "%H:%M").ok()?,
        })
    }
}

impl SunSchedule for FixedWindow {
    fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let date = now.date_naive();
        let start = date.and_time(self.start).and_utc();
        let end = date.and_time(self.end).and_utc();
        if self.end > self.start {
            return (start, end);
        }
        // Window spans midnight: attach it to the correct night.
        if now.time() < self.end {
            (start - Duration::days(1), end)
        } else {
            (start, end + Duration::days(1))
        }
    }
}

/// Gates detection on the schedule. When disabled, detection runs around
/// the clock; frames always keep flowing to preview and the ring buffer.
pub struct TwilightGate {
    enabled: bool,
    schedule: Option<Box<dyn SunSchedule>>,
}

impl TwilightGate {
    pub fn new(enabled: bool, schedule: Option<Box<dyn SunSchedule>>) -> Self {
        Self { enabled, schedule }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            schedule: None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }
        match &self.schedule {
            Some(schedule) => {
                let (start, end) = schedule.window(now);
                now >= start && now <= end
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, h, m, 0).unwrap()
    }

    #[test]
    fn overnight_window_spans_midnight() {
        let w = FixedWindow::parse("18:00", "06:00").unwrap();
        let gate = TwilightGate::new(true, Some(Box::new(w)));
        assert!(gate.is_active(at(23, 0)));
        assert!(gate.is_active(at(2, 0)));
        assert!(!gate.is_active(at(12, 0)));
        assert!(gate.is_active(at(18, 0)));
        assert!(gate.is_active(at(6, 0)));
        assert!(!gate.is_active(at(6, 1)));
    }

    #[test]
    fn same_day_window() {
        let w = FixedWindow::parse("01:00", "05:00").unwrap();
        let gate = TwilightGate::new(true, Some(Box::new(w)));
        assert!(gate.is_active(at(3, 0)));
        assert!(!gate.is_active(at(6, 0)));
    }

    #[test]
    fn disabled_gate_is_always_active() {
        let gate = TwilightGate::disabled();
        assert!(gate.is_active(at(12, 0)));
    }
}
