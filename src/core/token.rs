//! `value|instant` tokens stored as the single line of a flag file.

use crate::core::error::CairnError;
use crate::core::time;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedToken {
    pub value: String,
    pub time: DateTime<Utc>,
}

impl TimestampedToken {
    pub fn new(value: impl Into<String>, time: Option<DateTime<Utc>>) -> Self {
        Self {
            value: value.into(),
            time: time.unwrap_or_else(time::now),
        }
    }
}

impl fmt::Display for TimestampedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.value, time::format_iso(&self.time))
    }
}

impl FromStr for TimestampedToken {
    type Err = CairnError;

    /// Missing or empty parts default to `""` and "now".
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line.split_once('|') {
            Some((value, stamp)) if !stamp.trim().is_empty() => Ok(Self {
                value: value.to_string(),
                time: time::parse_iso(stamp)?,
            }),
            Some((value, _)) => Ok(Self::new(value, None)),
            None => Ok(Self::new(line, None)),
        }
    }
}
