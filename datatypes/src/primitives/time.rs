use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// A closed time interval with ISO-8601 endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimePeriod {
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { begin, end }
    }

    /// Parses `gml:beginPosition`/`gml:endPosition` style timestamps.
    /// Date-only values are accepted and taken at midnight UTC.
    pub fn from_strings(begin: &str, end: &str) -> Result<Self> {
        Ok(Self {
            begin: parse_timestamp(begin)?,
            end: parse_timestamp(end)?,
        })
    }

    pub fn overlaps(&self, other: &TimePeriod) -> bool {
        self.begin <= other.end && self.end >= other.begin
    }
}

pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return Ok(DateTime::from_utc(dt, Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(DateTime::from_utc(d.and_hms_opt(0, 0, 0).expect("midnight"), Utc));
    }
    Err(Error::TimestampParse {
        input: input.to_owned(),
    })
}
