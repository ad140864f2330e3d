//! Time-window arithmetic for named granularities.
//!
//! All calculations are UTC and total: every instant belongs to exactly one period of every
//! granularity. `second`, `minute`, `hour` and `day` truncate the corresponding field, weeks start
//! on Monday 00:00, months and years on the 1st. `eternity` maps every instant to one fixed
//! sentinel interval that is never rendered in reports.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use dashmap::DashMap;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;

/// Start of the eternity sentinel interval (1970-01-01T00:00:00Z).
pub const ETERNITY_START_SECONDS: i64 = 0;
/// End of the eternity sentinel interval (9999-12-31T23:59:59Z).
pub const ETERNITY_END_SECONDS: i64 = 253_402_300_799;

/// A named period width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    /// One second. Not a reporting granularity.
    Second,
    /// One minute.
    Minute,
    /// One hour.
    Hour,
    /// One day.
    Day,
    /// One week, starting Monday.
    Week,
    /// One calendar month.
    Month,
    /// One calendar year.
    Year,
    /// A single interval covering all time.
    Eternity,
}

impl Granularity {
    /// Granularities counters are kept for by default.
    pub const REPORTING: [Granularity; 7] = [
        Granularity::Eternity,
        Granularity::Year,
        Granularity::Month,
        Granularity::Week,
        Granularity::Day,
        Granularity::Hour,
        Granularity::Minute,
    ];

    /// Name used in storage keys and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
            Granularity::Eternity => "eternity",
        }
    }

    /// Expiry for counters of this granularity, three times the bucket width.
    ///
    /// Only `minute` and finer expire; everything coarser is kept until explicitly deleted.
    pub fn ttl_seconds(&self) -> Option<u64> {
        match self {
            Granularity::Second => Some(3),
            Granularity::Minute => Some(3 * SECONDS_PER_MINUTE as u64),
            _ => None,
        }
    }

    fn token_format(&self) -> &'static str {
        match self {
            Granularity::Second => "%Y%m%d%H%M%S",
            Granularity::Minute => "%Y%m%d%H%M",
            Granularity::Hour => "%Y%m%d%H",
            Granularity::Day | Granularity::Week | Granularity::Month | Granularity::Year => {
                "%Y%m%d"
            }
            Granularity::Eternity => "",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "second" => Ok(Granularity::Second),
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            "eternity" => Ok(Granularity::Eternity),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(seconds, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn first_of_month(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn truncate(instant: DateTime<Utc>, width: i64) -> DateTime<Utc> {
    let ts = instant.timestamp();
    at(ts - ts.rem_euclid(width))
}

/// Start of the period of `granularity` containing `instant`.
pub fn start_of(granularity: Granularity, instant: DateTime<Utc>) -> DateTime<Utc> {
    match granularity {
        Granularity::Second => truncate(instant, 1),
        Granularity::Minute => truncate(instant, SECONDS_PER_MINUTE),
        Granularity::Hour => truncate(instant, SECONDS_PER_HOUR),
        Granularity::Day => truncate(instant, SECONDS_PER_DAY),
        Granularity::Week => {
            let day = truncate(instant, SECONDS_PER_DAY);
            let offset = i64::from(day.weekday().num_days_from_monday());
            at(day.timestamp() - offset * SECONDS_PER_DAY)
        }
        Granularity::Month => first_of_month(instant.year(), instant.month()),
        Granularity::Year => first_of_month(instant.year(), 1),
        Granularity::Eternity => at(ETERNITY_START_SECONDS),
    }
}

/// Exclusive end of the period of `granularity` containing `instant`.
pub fn end_of(granularity: Granularity, instant: DateTime<Utc>) -> DateTime<Utc> {
    let start = start_of(granularity, instant);

    match granularity {
        Granularity::Second => at(start.timestamp() + 1),
        Granularity::Minute => at(start.timestamp() + SECONDS_PER_MINUTE),
        Granularity::Hour => at(start.timestamp() + SECONDS_PER_HOUR),
        Granularity::Day => at(start.timestamp() + SECONDS_PER_DAY),
        Granularity::Week => at(start.timestamp() + SECONDS_PER_WEEK),
        Granularity::Month => {
            if start.month() == 12 {
                first_of_month(start.year() + 1, 1)
            } else {
                first_of_month(start.year(), start.month() + 1)
            }
        }
        Granularity::Year => first_of_month(start.year() + 1, 1),
        Granularity::Eternity => at(ETERNITY_END_SECONDS),
    }
}

/// A concrete period instance: a granularity and the window it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    /// Width of the period.
    pub granularity: Granularity,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl Period {
    /// The period of `granularity` containing `instant`.
    pub fn containing(granularity: Granularity, instant: DateTime<Utc>) -> Self {
        Self {
            granularity,
            start: start_of(granularity, instant),
            end: end_of(granularity, instant),
        }
    }

    /// Whether `instant` falls inside this period.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Bounds as rendered in reports; `None` for eternity.
    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self.granularity {
            Granularity::Eternity => None,
            _ => Some((self.start, self.end)),
        }
    }

    /// Compact bucket token used in storage keys, e.g. `20100507` for a day.
    pub fn token(&self) -> String {
        match self.granularity {
            Granularity::Eternity => "eternity".to_string(),
            g => self.start.format(g.token_format()).to_string(),
        }
    }

    /// Parse a bucket token produced by [`Period::token`].
    ///
    /// Returns `None` if the token is malformed or not aligned to the granularity.
    pub fn from_token(granularity: Granularity, token: &str) -> Option<Self> {
        if granularity == Granularity::Eternity {
            return (token == "eternity").then(|| Self::containing(granularity, at(0)));
        }

        let expected_len = match granularity {
            Granularity::Second => 14,
            Granularity::Minute => 12,
            Granularity::Hour => 10,
            _ => 8,
        };

        if token.len() != expected_len || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let padded = format!("{token:0<14}");
        let start = NaiveDateTime::parse_from_str(&padded, "%Y%m%d%H%M%S")
            .ok()?
            .and_utc();

        let period = Self::containing(granularity, start);
        (period.start == start).then_some(period)
    }
}

/// Single-slot memo of the last period computed per granularity.
///
/// Consecutive calls whose instants share a bucket reuse the previous result. The cache only
/// ever returns a period that contains the requested instant, so it never changes results.
#[derive(Debug, Default)]
pub struct PeriodCache {
    last: DashMap<Granularity, Period>,
}

impl PeriodCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Same as [`Period::containing`], served from the cache when possible.
    pub fn period(&self, granularity: Granularity, instant: DateTime<Utc>) -> Period {
        if let Some(period) = self.last.get(&granularity)
            && period.contains(instant)
        {
            return *period;
        }

        let period = Period::containing(granularity, instant);
        self.last.insert(granularity, period);

        period
    }
}
