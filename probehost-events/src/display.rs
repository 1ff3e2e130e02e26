use std::fmt;

use chrono::{DateTime, Utc};

use super::TraceRecord;

/// Controls how the time should be displayed in a record line.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum TimeFormat {
    /// Do not print the time.
    #[default]
    Hidden,
    /// Raw monotonic timestamp, in nanoseconds.
    MonotonicTimestamp,
    /// Wall-clock UTC date, derived from the monotonic offset.
    UtcDate,
}

/// Controls how a record is formatted.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisplayFormat {
    /// How the time is formatted.
    pub time_format: TimeFormat,
    /// Offset of the monotonic clock to the wall-clock time, in nanoseconds.
    pub monotonic_offset: Option<i64>,
}

impl DisplayFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure how the time will be formatted.
    pub fn time_format(mut self, format: TimeFormat) -> Self {
        self.time_format = format;
        self
    }

    /// Sets the offset of the monotonic clock to the wall-clock time.
    pub fn monotonic_offset(mut self, offset: i64) -> Self {
        self.monotonic_offset = Some(offset);
        self
    }
}

/// Helper to display a record. It works by providing a wrapper implementing
/// std::fmt::Display, which allows taking the format as an argument, unlike a
/// plain Display implementation.
pub trait RecordDisplay {
    fn display<'a>(&'a self, format: &'a DisplayFormat) -> Box<dyn fmt::Display + 'a>;
}

struct TraceRecordDisplay<'a> {
    record: &'a TraceRecord,
    format: &'a DisplayFormat,
}

impl fmt::Display for TraceRecordDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format.time_format {
            TimeFormat::Hidden => (),
            TimeFormat::MonotonicTimestamp => write!(f, "{} ", self.record.timestamp)?,
            TimeFormat::UtcDate => {
                let offset = self.format.monotonic_offset.unwrap_or(0);
                let ns = self.record.timestamp as i64 + offset;
                match DateTime::<Utc>::from_timestamp(
                    ns.div_euclid(1_000_000_000),
                    ns.rem_euclid(1_000_000_000) as u32,
                ) {
                    Some(date) => write!(f, "{} ", date.format("%F %T.%6f"))?,
                    // Fall back to the raw timestamp rather than erroring out.
                    None => write!(f, "{} ", self.record.timestamp)?,
                }
            }
        }

        write!(f, "{}", self.record.message)
    }
}

impl RecordDisplay for TraceRecord {
    fn display<'a>(&'a self, format: &'a DisplayFormat) -> Box<dyn fmt::Display + 'a> {
        Box::new(TraceRecordDisplay {
            record: self,
            format,
        })
    }
}
