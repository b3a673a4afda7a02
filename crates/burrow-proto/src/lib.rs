//! Burrow wire protocol
//!
//! This crate defines everything that travels between the relay and a host:
//! the length-prefixed frame codec used on the control channel and for the
//! data-channel greeting, the command vocabulary on the control channel, the
//! handshake grammar, and the datagram framing used to carry UDP over a
//! byte-stream data channel.

pub mod codec;
pub mod datagram;
pub mod handshake;
pub mod messages;

pub use codec::{read_frame, write_frame, CodecError, FrameCodec};
pub use datagram::{FrameError, UdpFrame};
pub use handshake::{ChannelFlags, DataChannelHello, HandshakeError, HostHello};
pub use messages::{
    ChannelKind, HostCommand, HostMessage, MessageError, ServerCommand, ServerMessage,
};

/// Two-character prefix that marks a control-channel string as a command
pub const COMMAND_MARKER: &str = ":>";

/// Maximum control frame size (64KB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Field separator used by the handshake and by command arguments
pub const FIELD_SEPARATOR: char = ';';
