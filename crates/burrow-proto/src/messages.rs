//! Control-channel message types
//!
//! Every frame on the control channel is either a plain text line meant for
//! the operator of the host, or a command: the [`COMMAND_MARKER`] followed by
//! a verb and `;`-separated arguments.

use crate::{COMMAND_MARKER, FIELD_SEPARATOR};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Message parse errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MessageError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed command {verb}: {reason}")]
    Malformed { verb: String, reason: String },

    #[error("Unknown channel kind: {0}")]
    UnknownChannelKind(String),
}

/// Kind of data channel; TCP and UDP session ids live in separate namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Tcp,
    Udp,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Tcp => "TCP",
            ChannelKind::Udp => "UDP",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(ChannelKind::Tcp),
            "UDP" => Ok(ChannelKind::Udp),
            other => Err(MessageError::UnknownChannelKind(other.to_string())),
        }
    }
}

/// Commands sent from the relay to a host
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    /// Handshake accepted; port, balance, expiry and address lines follow
    Ok,
    /// Session is over
    Exit,
    /// Session is over because the key ran out of quota
    ExitNoFlow,
    /// Reply to a host heartbeat
    Pong,
    /// Ask the host to dial back a data channel tagged with `session_id`
    SendSocket {
        kind: ChannelKind,
        session_id: u64,
        client: SocketAddr,
    },
}

impl ServerCommand {
    fn verb(&self) -> &'static str {
        match self {
            ServerCommand::Ok => "ok",
            ServerCommand::Exit => "exit",
            ServerCommand::ExitNoFlow => "exitNoFlow",
            ServerCommand::Pong => "pong",
            ServerCommand::SendSocket {
                kind: ChannelKind::Tcp,
                ..
            } => "sendSocketTCP",
            ServerCommand::SendSocket {
                kind: ChannelKind::Udp,
                ..
            } => "sendSocketUDP",
        }
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", COMMAND_MARKER, self.verb())?;
        if let ServerCommand::SendSocket {
            session_id, client, ..
        } = self
        {
            write!(f, "{sep}{}{sep}{}", session_id, client, sep = FIELD_SEPARATOR)?;
        }
        Ok(())
    }
}

impl FromStr for ServerCommand {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(COMMAND_MARKER)
            .ok_or_else(|| MessageError::UnknownCommand(s.to_string()))?;
        let mut parts = body.split(FIELD_SEPARATOR);
        let verb = parts.next().unwrap_or_default();

        let kind = match verb {
            "ok" => return Ok(ServerCommand::Ok),
            "exit" => return Ok(ServerCommand::Exit),
            "exitNoFlow" => return Ok(ServerCommand::ExitNoFlow),
            "pong" => return Ok(ServerCommand::Pong),
            "sendSocketTCP" => ChannelKind::Tcp,
            "sendSocketUDP" => ChannelKind::Udp,
            other => return Err(MessageError::UnknownCommand(other.to_string())),
        };

        let malformed = |reason: &str| MessageError::Malformed {
            verb: verb.to_string(),
            reason: reason.to_string(),
        };
        let session_id = parts
            .next()
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| malformed("missing or invalid session id"))?;
        let client = parts
            .next()
            .and_then(|addr| addr.parse::<SocketAddr>().ok())
            .ok_or_else(|| malformed("missing or invalid client address"))?;

        Ok(ServerCommand::SendSocket {
            kind,
            session_id,
            client,
        })
    }
}

/// A frame sent from the relay to a host
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Text(String),
    Command(ServerCommand),
}

impl ServerMessage {
    pub fn text(s: impl Into<String>) -> Self {
        ServerMessage::Text(s.into())
    }

    pub fn parse(s: &str) -> Result<Self, MessageError> {
        if s.starts_with(COMMAND_MARKER) {
            s.parse().map(ServerMessage::Command)
        } else {
            Ok(ServerMessage::Text(s.to_string()))
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Text(text) => f.write_str(text),
            ServerMessage::Command(cmd) => cmd.fmt(f),
        }
    }
}

impl From<ServerCommand> for ServerMessage {
    fn from(cmd: ServerCommand) -> Self {
        ServerMessage::Command(cmd)
    }
}

/// Commands sent from a host to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// Liveness marker
    Ping,
    SetTcp(bool),
    SetUdp(bool),
    /// Host is shutting down the session
    Exit,
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            HostCommand::Ping => "ping",
            HostCommand::SetTcp(true) => "enableTCP",
            HostCommand::SetTcp(false) => "disableTCP",
            HostCommand::SetUdp(true) => "enableUDP",
            HostCommand::SetUdp(false) => "disableUDP",
            HostCommand::Exit => "exit",
        };
        write!(f, "{}{}", COMMAND_MARKER, verb)
    }
}

impl FromStr for HostCommand {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let verb = s
            .strip_prefix(COMMAND_MARKER)
            .ok_or_else(|| MessageError::UnknownCommand(s.to_string()))?;
        match verb {
            "ping" => Ok(HostCommand::Ping),
            "enableTCP" => Ok(HostCommand::SetTcp(true)),
            "disableTCP" => Ok(HostCommand::SetTcp(false)),
            "enableUDP" => Ok(HostCommand::SetUdp(true)),
            "disableUDP" => Ok(HostCommand::SetUdp(false)),
            "exit" => Ok(HostCommand::Exit),
            other => Err(MessageError::UnknownCommand(other.to_string())),
        }
    }
}

/// A frame sent from a host to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    Command(HostCommand),
    Text(String),
}

impl HostMessage {
    pub fn parse(s: &str) -> Result<Self, MessageError> {
        if s.starts_with(COMMAND_MARKER) {
            s.parse().map(HostMessage::Command)
        } else {
            Ok(HostMessage::Text(s.to_string()))
        }
    }
}

impl fmt::Display for HostMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostMessage::Command(cmd) => cmd.fmt(f),
            HostMessage::Text(text) => f.write_str(text),
        }
    }
}
