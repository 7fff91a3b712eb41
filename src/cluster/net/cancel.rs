//! Per-connection cancellation.
//!
//! A [`CancelToken`] is handed to every blocking call a worker makes on its
//! task connection. Whoever holds the matching [`Canceller`] (usually a
//! [`Watchdog`]) can end all of them at once, and a token may carry a deadline
//! of its own.

use std::{future::Future, io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::watch,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::debug;

use super::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("connection failed ({0:?})")]
    ConnectionFailed(io::ErrorKind),
    #[error("peer sent data out of turn")]
    UnexpectedData,
    #[error("deadline elapsed")]
    DeadlineElapsed,
}

/// Creates a connected canceller/token pair.
pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (tx, rx) = watch::channel(None);
    (
        Canceller { tx: Arc::new(tx) },
        CancelToken { rx, deadline: None },
    )
}

#[derive(Debug, Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl Canceller {
    /// Cancels every token of this pair. Only the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that additionally fires at `deadline`.
    pub fn with_deadline(&self, deadline: Option<Instant>) -> Self {
        Self {
            rx: self.rx.clone(),
            deadline,
        }
    }

    /// The reason this token was cancelled, if it has been. Deadlines are not
    /// reported here.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled or its deadline passes. Never
    /// resolves if every canceller is gone and there is no deadline.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        let signalled = async move {
            loop {
                if let Some(reason) = *rx.borrow_and_update() {
                    return reason;
                }
                if rx.changed().await.is_err() {
                    return std::future::pending().await;
                }
            }
        };
        match self.deadline {
            Some(deadline) => tokio::select! {
                reason = signalled => reason,
                _ = sleep_until(deadline) => CancelReason::DeadlineElapsed,
            },
            None => signalled.await,
        }
    }

    /// Runs `fut` unless the token fires first.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(Error::Cancelled(reason)),
            res = fut => res,
        }
    }
}

/// Watches a connection that should stay quiet and cancels the round on any
/// activity: end of stream, a socket error (keep-alive expiry included), or
/// stray bytes.
///
/// Disarmed when dropped.
pub struct Watchdog {
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub fn arm<R>(mut reader: R, canceller: Canceller) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            let reason = match reader.read(&mut byte).await {
                Ok(0) => CancelReason::PeerClosed,
                Ok(_) => CancelReason::UnexpectedData,
                Err(e) => CancelReason::ConnectionFailed(e.kind()),
            };
            debug!(%reason, "watchdog fired");
            canceller.cancel(reason);
        });
        Self { handle }
    }

    pub fn disarm(self) {}
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
