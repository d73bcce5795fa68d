//! Reporting periods and their resolution to concrete UTC ranges.
//!
//! Every aggregation query takes an explicit window; there is deliberately no
//! "all time" period. `today` is timezone-sensitive (midnight in the caller's
//! offset), the rolling periods are not.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A named reporting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// From midnight in the requested timezone until now.
    Today,
    /// The last rolling 24 hours.
    #[serde(rename = "24h")]
    Last24h,
    /// The last rolling 7 days.
    #[serde(rename = "7d")]
    Last7d,
    /// The last rolling 30 days.
    #[serde(rename = "30d")]
    Last30d,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Today => "today",
            Period::Last24h => "24h",
            Period::Last7d => "7d",
            Period::Last30d => "30d",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(Period::Today),
            "24h" => Ok(Period::Last24h),
            "7d" => Ok(Period::Last7d),
            "30d" => Ok(Period::Last30d),
            other => Err(Error::InvalidPeriod(other.to_string())),
        }
    }
}

/// A resolved `[from, to)` query window in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub period: Period,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    /// Resolve a period against `now` in the given timezone offset.
    pub fn resolve(period: Period, now: DateTime<Utc>, tz: FixedOffset) -> Self {
        let from = match period {
            Period::Today => {
                let local_midnight = now
                    .with_timezone(&tz)
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is always a valid time")
                    .and_local_timezone(tz)
                    .single()
                    .expect("fixed offsets have no DST gaps");
                local_midnight.with_timezone(&Utc)
            }
            Period::Last24h => now - Duration::hours(24),
            Period::Last7d => now - Duration::days(7),
            Period::Last30d => now - Duration::days(30),
        };

        Self {
            period,
            from,
            to: now,
        }
    }
}

/// Parse a `tz` query parameter: `UTC` (default) or a fixed offset such as
/// `+05:00` / `-03:30`.
pub fn parse_timezone(tz: Option<&str>) -> Result<FixedOffset, Error> {
    match tz {
        None | Some("") | Some("UTC") | Some("utc") => {
            Ok(FixedOffset::east_opt(0).expect("zero offset is valid"))
        }
        Some(raw) => raw
            .parse::<FixedOffset>()
            .map_err(|_| Error::InvalidTimezone(raw.to_string())),
    }
}
