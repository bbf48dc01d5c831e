//! Error kinds for the interpreter core (see spec §7).

use std::fmt;

/// The interpreter's own error type.
///
/// Each variant corresponds to one row of the error table: an `unexpected`
/// token or unbalanced braces become [`SrvshError::Parse`], a failed syscall
/// becomes [`SrvshError::Io`], and a failed allocation or fork/spawn becomes
/// [`SrvshError::Resource`]. Child exit codes are not errors — they are
/// aggregated by `reaper`, not propagated here.
#[derive(thiserror::Error, Debug)]
pub enum SrvshError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("unknown opcode: {0}")]
    OpcodeUnknown(String),
}

impl SrvshError {
    pub fn parse(msg: impl fmt::Display) -> Self {
        Self::Parse(msg.to_string())
    }

    pub fn resource(msg: impl fmt::Display) -> Self {
        Self::Resource(msg.to_string())
    }
}

impl From<nix::Error> for SrvshError {
    fn from(e: nix::Error) -> Self {
        Self::Io(std::io::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, SrvshError>;
