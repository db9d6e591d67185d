//! Send failures and their classification.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SendError>;

#[derive(Debug, Error)]
pub enum SendError {
    /// The address exists but cannot take the message right now.
    #[error("address not ready: {0}")]
    NotReady(String),

    /// No route to the address.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The session was closed by either side.
    #[error("session closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    /// Transient failures are worth retrying after a short delay.
    pub fn is_transient(&self) -> bool {
        match self {
            SendError::NotReady(_) => true,
            SendError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
            ),
            SendError::Unreachable(_) | SendError::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(SendError::NotReady("a".into()).is_transient());
        assert!(SendError::Io(io::ErrorKind::WouldBlock.into()).is_transient());
        assert!(!SendError::Io(io::ErrorKind::InvalidData.into()).is_transient());
        assert!(!SendError::Unreachable("a".into()).is_transient());
        assert!(!SendError::Closed.is_transient());
    }
}
