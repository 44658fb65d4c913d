//! Runtime-level errors.

use crate::store::StoreError;
use flowspace::{ErrorKind, FlowSpaceError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Validation or lookup failure while building a submission
    #[error(transparent)]
    FlowSpace(#[from] FlowSpaceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The mutation controller no longer accepts work
    #[error("flowspace controller has stopped")]
    ControllerStopped,

    /// Non-blocking submission found the queue full
    #[error("flowspace mutation queue is full")]
    QueueFull,

    #[error("configuration error: {0}")]
    Config(String),

    /// Controller or subscriber thread could not be started
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("runtime task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BridgeError {
    /// Kind tag of a wrapped FlowSpace error.
    pub fn flowspace_kind(&self) -> Option<ErrorKind> {
        match self {
            BridgeError::FlowSpace(e) => Some(e.kind()),
            _ => None,
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_thread_spawn_failure_is_io() {
        let err: BridgeError = io::Error::new(io::ErrorKind::WouldBlock, "no threads left").into();
        assert!(matches!(err, BridgeError::Io(_)));
        assert_eq!(err.flowspace_kind(), None);
        assert!(err.to_string().contains("no threads left"));
    }

    #[test]
    fn test_flowspace_kind_passthrough() {
        let err: BridgeError = FlowSpaceError::not_found("name=x").into();
        assert_eq!(err.flowspace_kind(), Some(ErrorKind::NotFound));
    }
}
