use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("short packet: {len} bytes, need at least {need}")]
    ShortPacket { len: usize, need: usize },

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("invalid policy: {0}")]
    Policy(String),

    #[error("no endpoint set for packet written to {device}")]
    NoEndpoint { device: String },

    #[error("unsupported protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("short write on {device}: wrote {written} of {expected} bytes")]
    ShortWrite {
        device: String,
        written: usize,
        expected: usize,
    },

    #[error("device {name} is not running")]
    NotRunning { name: String },

    #[error("device {name} cannot be read")]
    NotReadable { name: String },

    #[error("device {name} already started")]
    AlreadyStarted { name: String },

    #[error("a {kind} device is already registered")]
    DuplicateDevice { kind: String },

    #[error("queue full on {0}")]
    Backpressure(String),

    #[error("device {name}: {reason}")]
    Device { name: String, reason: String },

    #[error("invalid interface name {name:?}")]
    InvalidInterfaceName { name: String },
}

impl Error {
    /// True for errors that only affect the packet being processed.
    pub fn is_packet_error(&self) -> bool {
        matches!(
            self,
            Error::ShortPacket { .. }
                | Error::UnsupportedVersion(_)
                | Error::InvalidPacket(_)
                | Error::NoEndpoint { .. }
                | Error::UnsupportedProtocol(_)
                | Error::ShortWrite { .. }
                | Error::Backpressure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
