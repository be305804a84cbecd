//! Error taxonomy for the agent.
//!
//! Every error is classified into a [`Disposition`] so callers never have
//! to re-derive "should this be fatal?" from the variant by hand.

use thiserror::Error;

/// How a caller should react to an [`RfClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Expected, not worth a log line (e.g. `EAGAIN` on a non-blocking connect).
    Ignored,
    /// Log and drop the single message/route/frame; keep the thread alive.
    Logged,
    /// Unrecoverable; the agent should exit non-zero.
    Fatal,
}

#[derive(Error, Debug)]
pub enum RfClientError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("duplicate route add for {0}")]
    DuplicateRoute(String),

    #[error("route removal for {0} but not in routing table")]
    MissingRoute(String),

    #[error("unknown operation code: {0}")]
    UnknownOpCode(String),

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("FPM framing error: {0}")]
    Fpm(String),

    #[error("IPC transport error: {0}")]
    Ipc(String),

    #[error("no usable interfaces found")]
    NoUsableInterfaces,

    #[error("socket setup failed: {0}")]
    SocketSetup(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RfClientError {
    pub fn disposition(&self) -> Disposition {
        match self {
            RfClientError::DuplicateRoute(_)
            | RfClientError::MissingRoute(_)
            | RfClientError::UnknownOpCode(_)
            | RfClientError::Malformed(_)
            | RfClientError::InterfaceNotFound(_) => Disposition::Logged,

            RfClientError::NoUsableInterfaces | RfClientError::SocketSetup(_) => {
                Disposition::Fatal
            }

            RfClientError::Netlink(_) | RfClientError::Fpm(_) | RfClientError::Ipc(_) => {
                Disposition::Logged
            }

            RfClientError::Io(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock => Disposition::Ignored,
                _ => Disposition::Logged,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RfClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_route_is_logged_not_fatal() {
        let err = RfClientError::DuplicateRoute("10.0.0.0/24 via 1.1.1.1".into());
        assert_eq!(err.disposition(), Disposition::Logged);
    }

    #[test]
    fn no_usable_interfaces_is_fatal() {
        assert_eq!(
            RfClientError::NoUsableInterfaces.disposition(),
            Disposition::Fatal
        );
    }

    #[test]
    fn would_block_is_ignored() {
        let io = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert_eq!(RfClientError::Io(io).disposition(), Disposition::Ignored);
    }
}
