use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("operation in wrong connection state: {0}")]
    WrongState(&'static str),

    #[error("listener is already bound")]
    AlreadyBound,

    #[error("event loop has shut down")]
    LoopGone,

    #[error("task was dropped before producing a result")]
    TaskDropped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
