//! Handshake grammar for control and data channels
//!
//! Control channel greeting: `<lang>;<version>;<keyName>[;<TU-flags>]`
//! Data channel greeting: `<TCP|UDP>;<sessionID>`

use crate::messages::ChannelKind;
use crate::FIELD_SEPARATOR;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Handshake parse errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandshakeError {
    #[error("Expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },

    #[error("Empty field: {0}")]
    EmptyField(&'static str),

    #[error("Invalid channel flags: {0}")]
    InvalidFlags(String),

    #[error("Invalid channel kind: {0}")]
    InvalidKind(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
}

/// Which sub-channels a host wants enabled when its session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFlags {
    pub tcp: bool,
    pub udp: bool,
}

impl Default for ChannelFlags {
    fn default() -> Self {
        Self {
            tcp: true,
            udp: true,
        }
    }
}

impl FromStr for ChannelFlags {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = ChannelFlags {
            tcp: false,
            udp: false,
        };
        for c in s.chars() {
            match c.to_ascii_uppercase() {
                'T' if !flags.tcp => flags.tcp = true,
                'U' if !flags.udp => flags.udp = true,
                _ => return Err(HandshakeError::InvalidFlags(s.to_string())),
            }
        }
        if !flags.tcp && !flags.udp {
            return Err(HandshakeError::InvalidFlags(s.to_string()));
        }
        Ok(flags)
    }
}

impl fmt::Display for ChannelFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tcp {
            f.write_str("T")?;
        }
        if self.udp {
            f.write_str("U")?;
        }
        Ok(())
    }
}

/// First frame a host sends on the control channel
#[derive(Debug, Clone, PartialEq)]
pub struct HostHello {
    pub lang: String,
    pub version: String,
    pub key_name: String,
    pub channels: ChannelFlags,
}

impl FromStr for HostHello {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split(FIELD_SEPARATOR).collect();
        if fields.len() < 3 {
            return Err(HandshakeError::MissingFields {
                expected: 3,
                got: fields.len(),
            });
        }

        let lang = fields[0].trim();
        let version = fields[1].trim();
        let key_name = fields[2].trim();
        if version.is_empty() {
            return Err(HandshakeError::EmptyField("version"));
        }
        if key_name.is_empty() {
            return Err(HandshakeError::EmptyField("key"));
        }

        let channels = match fields.get(3).map(|f| f.trim()) {
            Some(flags) if !flags.is_empty() => flags.parse()?,
            _ => ChannelFlags::default(),
        };

        Ok(Self {
            lang: lang.to_string(),
            version: version.to_string(),
            key_name: key_name.to_string(),
            channels,
        })
    }
}

impl fmt::Display for HostHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{lang}{sep}{version}{sep}{key}{sep}{flags}",
            lang = self.lang,
            version = self.version,
            key = self.key_name,
            flags = self.channels,
            sep = FIELD_SEPARATOR
        )
    }
}

/// First frame a host sends on a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannelHello {
    pub kind: ChannelKind,
    pub session_id: u64,
}

impl FromStr for DataChannelHello {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .trim()
            .split_once(FIELD_SEPARATOR)
            .ok_or(HandshakeError::MissingFields {
                expected: 2,
                got: 1,
            })?;
        let kind = kind
            .parse::<ChannelKind>()
            .map_err(|_| HandshakeError::InvalidKind(kind.to_string()))?;
        let session_id = id
            .parse::<u64>()
            .map_err(|_| HandshakeError::InvalidSessionId(id.to_string()))?;
        Ok(Self { kind, session_id })
    }
}

impl fmt::Display for DataChannelHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.kind, FIELD_SEPARATOR, self.session_id)
    }
}
