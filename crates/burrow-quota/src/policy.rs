//! Port policy and expiry time formats as they are persisted

use chrono::NaiveDateTime;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Persisted expiry format, e.g. `2026/12/31-23:59`
pub const EXPIRE_FORMAT: &str = "%Y/%m/%d-%H:%M";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolicyError {
    #[error("Invalid port policy: {0} (expected PORT or START-END)")]
    InvalidPort(String),

    #[error("Invalid expire time: {0} (expected yyyy/MM/dd-HH:mm)")]
    InvalidExpire(String),
}

pub fn parse_expire(s: &str) -> Result<NaiveDateTime, PolicyError> {
    NaiveDateTime::parse_from_str(s.trim(), EXPIRE_FORMAT)
        .map_err(|_| PolicyError::InvalidExpire(s.to_string()))
}

pub fn format_expire(t: &NaiveDateTime) -> String {
    t.format(EXPIRE_FORMAT).to_string()
}

/// Which public port a key's session may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPolicy {
    /// Exactly this port
    Single(u16),
    /// Any free port in the inclusive range, chosen at session start
    Range { start: u16, end: u16 },
}

impl PortPolicy {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, PortPolicy::Range { .. })
    }

    pub fn range_start(&self) -> u16 {
        match self {
            PortPolicy::Single(port) => *port,
            PortPolicy::Range { start, .. } => *start,
        }
    }

    pub fn range_end(&self) -> u16 {
        match self {
            PortPolicy::Single(port) => *port,
            PortPolicy::Range { end, .. } => *end,
        }
    }

    /// Candidate ports in ascending order
    pub fn candidates(&self) -> std::ops::RangeInclusive<u16> {
        self.range_start()..=self.range_end()
    }
}

impl FromStr for PortPolicy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || PolicyError::InvalidPort(s.to_string());

        match s.split_once('-') {
            None => {
                let port: u16 = s.parse().map_err(|_| invalid())?;
                if port == 0 {
                    return Err(invalid());
                }
                Ok(PortPolicy::Single(port))
            }
            Some((start, end)) => {
                let start: u16 = start.trim().parse().map_err(|_| invalid())?;
                let end: u16 = end.trim().parse().map_err(|_| invalid())?;
                if start == 0 || start > end {
                    return Err(invalid());
                }
                Ok(PortPolicy::Range { start, end })
            }
        }
    }
}

impl fmt::Display for PortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortPolicy::Single(port) => write!(f, "{}", port),
            PortPolicy::Range { start, end } => write!(f, "{}-{}", start, end),
        }
    }
}
