//! Timestamp — strips the daemon's per-line timestamp prefix.
//!
//! With `timestamps=true` every line starts with an RFC3339Nano timestamp
//! and a single space: `2023-01-01T00:00:00.000000000Z message...`.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::demux::{RawLine, StreamTag};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("No timestamp separator in line")]
    MissingSeparator,
    #[error("Invalid timestamp prefix '{0}'")]
    Invalid(String),
}

/// Split `line` into its timestamp and the remaining text.
pub fn split_timestamp(line: &[u8]) -> Result<(DateTime<Utc>, &[u8]), TimestampError> {
    let idx = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(TimestampError::MissingSeparator)?;
    let prefix = &line[..idx];
    let ts_str = std::str::from_utf8(prefix)
        .map_err(|_| TimestampError::Invalid(String::from_utf8_lossy(prefix).into_owned()))?;
    let ts = DateTime::parse_from_rfc3339(ts_str)
        .map_err(|_| TimestampError::Invalid(ts_str.to_string()))?;
    Ok((ts.with_timezone(&Utc), &line[idx + 1..]))
}

/// A line with its timestamp resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamTag,
    pub text: String,
    /// Set when the prefix did not parse and `timestamp` is the local
    /// clock at parse time. The full line is kept as `text`.
    pub fallback: Option<TimestampError>,
}

impl ParsedLine {
    pub fn parse(raw: &RawLine) -> Self {
        match split_timestamp(&raw.bytes) {
            Ok((timestamp, rest)) => Self {
                timestamp,
                stream: raw.stream,
                text: String::from_utf8_lossy(rest).into_owned(),
                fallback: None,
            },
            Err(err) => Self {
                timestamp: Utc::now(),
                stream: raw.stream,
                text: String::from_utf8_lossy(&raw.bytes).into_owned(),
                fallback: Some(err),
            },
        }
    }
}
