//! Error type for everything above the record codec.
//!
//! The codec itself speaks `io::Error`, since that is what `tokio_util::codec` wants; those
//! errors arrive here through the `Io` variant.

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer shut down its side of the connection (a receive returned zero bytes).
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("socket {} is already in use", .path.display())]
    AddressInUse {
        path: PathBuf,
    },

    #[error("descriptor {fd} is not a usable socket: {reason}")]
    InvalidDescriptor {
        fd: RawFd,
        reason: String,
    },

    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("invalid value {value:?} for setting {name}: {reason}")]
    InvalidSetting {
        name: String,
        value: String,
        reason: String,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("failed to spawn child {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("no live worker to hand the connection to")]
    NoWorkers,

    #[error("server was already started")]
    AlreadyStarted,
}

impl Error {
    /// True if this is the permission failure `start` reports instead of propagating.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}
