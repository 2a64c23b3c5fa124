//! Recurring fire times: daily, weekly or monthly at a wall-clock time.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Days scanned before giving up; every cadence matches at least once a month.
const SEARCH_DAYS: u32 = 62;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Cadence {
    Daily {
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },
    Weekly {
        weekday: Weekday,
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },
    /// Days past the end of a short month fire on its last day.
    Monthly {
        day: u32,
        #[serde(with = "hhmm")]
        time: NaiveTime,
    },
}

impl Cadence {
    pub fn time(&self) -> NaiveTime {
        match self {
            Cadence::Daily { time } | Cadence::Weekly { time, .. } | Cadence::Monthly { time, .. } => *time,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Cadence::Monthly { day, .. } if !(1..=31).contains(day) => {
                Err(format!("day of month must be 1-31, got {}", day))
            }
            _ => Ok(()),
        }
    }

    fn matches(&self, date: NaiveDate) -> bool {
        match self {
            Cadence::Daily { .. } => true,
            Cadence::Weekly { weekday, .. } => date.weekday() == *weekday,
            Cadence::Monthly { day, .. } => date.day() == (*day).min(last_day_of_month(date)),
        }
    }
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Map a wall-clock time onto `tz`. Times skipped by a DST jump move forward
/// an hour; repeated times take the earlier instant.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

/// First fire time strictly after `after`, in the same time zone.
pub fn next_fire_after<Tz: TimeZone>(cadence: &Cadence, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let tz = after.timezone();
    let mut date = after.date_naive();

    for _ in 0..SEARCH_DAYS {
        if cadence.matches(date) {
            if let Some(candidate) = resolve_local(&tz, date.and_time(cadence.time())) {
                if candidate > *after {
                    return Some(candidate);
                }
            }
        }
        date = date.succ_opt()?;
    }
    None
}

pub fn parse_time(input: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M")
        .map_err(|_| format!("invalid time '{}', expected HH:MM", input))
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Daily { time } => write!(f, "daily {}", time.format("%H:%M")),
            Cadence::Weekly { weekday, time } => write!(
                f,
                "weekly {} {}",
                weekday.to_string().to_lowercase(),
                time.format("%H:%M")
            ),
            Cadence::Monthly { day, time } => write!(f, "monthly {} {}", day, time.format("%H:%M")),
        }
    }
}

/// `daily 03:00`, `weekly sun 02:00`, `monthly 1 01:00`
impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let cadence = match parts.as_slice() {
            [kind, time] if kind.eq_ignore_ascii_case("daily") => Cadence::Daily {
                time: parse_time(time)?,
            },
            [kind, weekday, time] if kind.eq_ignore_ascii_case("weekly") => Cadence::Weekly {
                weekday: weekday
                    .parse()
                    .map_err(|_| format!("invalid weekday '{}'", weekday))?,
                time: parse_time(time)?,
            },
            [kind, day, time] if kind.eq_ignore_ascii_case("monthly") => Cadence::Monthly {
                day: day.parse().map_err(|_| format!("invalid day of month '{}'", day))?,
                time: parse_time(time)?,
            },
            _ => return Err(format!("unrecognised cadence '{}'", s)),
        };
        cadence.validate()?;
        Ok(cadence)
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_daily_is_strictly_after() {
        let daily = Cadence::Daily { time: hm(3, 0) };
        assert_eq!(next_fire_after(&daily, &at(2025, 6, 15, 2, 59)), Some(at(2025, 6, 15, 3, 0)));
        assert_eq!(next_fire_after(&daily, &at(2025, 6, 15, 3, 0)), Some(at(2025, 6, 16, 3, 0)));
        assert_eq!(next_fire_after(&daily, &at(2025, 12, 31, 4, 0)), Some(at(2026, 1, 1, 3, 0)));
    }

    #[test]
    fn test_weekly() {
        let weekly = Cadence::Weekly { weekday: Weekday::Sun, time: hm(2, 0) };
        // 2025-06-15 is a Sunday
        assert_eq!(next_fire_after(&weekly, &at(2025, 6, 12, 12, 0)), Some(at(2025, 6, 15, 2, 0)));
        assert_eq!(next_fire_after(&weekly, &at(2025, 6, 15, 2, 0)), Some(at(2025, 6, 22, 2, 0)));
    }

    #[test]
    fn test_monthly_clamps_to_month_end() {
        let monthly = Cadence::Monthly { day: 31, time: hm(1, 0) };
        assert_eq!(next_fire_after(&monthly, &at(2025, 2, 1, 0, 0)), Some(at(2025, 2, 28, 1, 0)));
        assert_eq!(next_fire_after(&monthly, &at(2024, 2, 1, 0, 0)), Some(at(2024, 2, 29, 1, 0)));
        assert_eq!(next_fire_after(&monthly, &at(2025, 2, 28, 1, 0)), Some(at(2025, 3, 31, 1, 0)));

        let first = Cadence::Monthly { day: 1, time: hm(1, 0) };
        assert_eq!(next_fire_after(&first, &at(2025, 12, 1, 2, 0)), Some(at(2026, 1, 1, 1, 0)));
    }

    #[test]
    fn test_respects_time_zone() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2025, 6, 15, 2, 30, 0).unwrap();
        let daily = Cadence::Daily { time: hm(3, 0) };

        let next = next_fire_after(&daily, &now).unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2025, 6, 15, 3, 0, 0).unwrap());
        assert_eq!(next.with_timezone(&Utc), at(2025, 6, 15, 1, 0));
    }

    #[test]
    fn test_parse_and_display() {
        for text in ["daily 03:00", "weekly sun 02:00", "monthly 1 01:00"] {
            let cadence: Cadence = text.parse().unwrap();
            assert_eq!(cadence.to_string(), text);
        }
        assert!("monthly 0 01:00".parse::<Cadence>().is_err());
        assert!("daily 25:00".parse::<Cadence>().is_err());
        assert!("hourly".parse::<Cadence>().is_err());
    }

    #[test]
    fn test_serde_shape() {
        let cadence = Cadence::Weekly { weekday: Weekday::Sun, time: hm(2, 0) };
        let json = serde_json::to_value(cadence).unwrap();
        assert_eq!(json["kind"], "weekly");
        assert_eq!(json["time"], "02:00");

        let parsed: Cadence =
            serde_json::from_str(r#"{"kind":"monthly","day":15,"time":"04:30"}"#).unwrap();
        assert_eq!(parsed, Cadence::Monthly { day: 15, time: hm(4, 30) });
    }
}
