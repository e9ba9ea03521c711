use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("device {op} failed: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("pipeline is not streaming")]
    NotStreaming,

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub(crate) fn device(op: &'static str, source: io::Error) -> Self {
        Self::Device { op, source }
    }

    pub(crate) fn errno(op: &'static str, errno: nix::errno::Errno) -> Self {
        Self::Device {
            op,
            source: io::Error::from(errno),
        }
    }
}
