use std::{io, net::SocketAddr};

use crate::cluster::executor::ExecError;

use super::cancel::CancelReason;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to set up {what}: {source}")]
    Setup { what: &'static str, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection lost")]
    ConnectionLost,
    #[error("connect to {0} timed out")]
    ConnectTimedOut(SocketAddr),
    #[error("no workers available")]
    NoWorkersAvailable,
    #[error("worker {worker} reported a non-positive speed {speed}")]
    BadSpeed { worker: usize, speed: i32 },
    #[error("failed to send task to worker {worker}: {source}")]
    Dispatch { worker: usize, source: Box<Error> },
    #[error("round cancelled: {0}")]
    Cancelled(CancelReason),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Which class of failure an [`Error`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A socket could not be created, bound or listened on. Ends the role.
    Setup,
    /// A peer misbehaved or went away. The peer is dropped from the round.
    Protocol,
    /// A bounded wait ran out. The caller carries on with what it has.
    Timeout,
    /// The round was cancelled before the peer's next blocking call failed.
    Cancellation,
    /// The local round could not run at all.
    Resource,
}

impl Error {
    pub fn setup(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Setup { what, source }
    }

    pub fn fault(&self) -> Fault {
        match self {
            Error::Setup { .. } => Fault::Setup,
            Error::Io(_) | Error::ConnectionLost | Error::BadSpeed { .. } => {
                Fault::Protocol
            }
            Error::Dispatch { source, .. } => source.fault(),
            Error::ConnectTimedOut(_) | Error::NoWorkersAvailable => {
                Fault::Timeout
            }
            Error::Cancelled(_) | Error::Exec(ExecError::Aborted) => {
                Fault::Cancellation
            }
            Error::Exec(_) => Fault::Resource,
        }
    }

    /// Only setup faults end the process; everything else is per-round.
    pub fn is_fatal(&self) -> bool {
        self.fault() == Fault::Setup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        let setup = Error::setup("listener")(in_use);
        assert_eq!(setup.fault(), Fault::Setup);
        assert!(setup.is_fatal());
        assert_eq!(Error::ConnectionLost.fault(), Fault::Protocol);
        assert_eq!(Error::NoWorkersAvailable.fault(), Fault::Timeout);
        assert!(!Error::NoWorkersAvailable.is_fatal());
        assert_eq!(
            Error::Cancelled(CancelReason::PeerClosed).fault(),
            Fault::Cancellation
        );
        let aborted = Error::Exec(ExecError::Aborted);
        assert_eq!(aborted.fault(), Fault::Cancellation);
        let no_threads = Error::Exec(ExecError::NoThreads);
        assert_eq!(no_threads.fault(), Fault::Resource);
        let dispatch = Error::Dispatch {
            worker: 2,
            source: Box::new(Error::Io(io::ErrorKind::BrokenPipe.into())),
        };
        assert_eq!(dispatch.fault(), Fault::Protocol);
        assert!(dispatch.to_string().contains("worker 2"));
    }
}
