use std::{
    io::{Read, Write},
    os::{
        fd::{AsFd, BorrowedFd},
        unix::net::UnixStream,
    },
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use snafu::ResultExt;

use crate::error::{ServerError, WakerSnafu};

/// Cancellation token shared between the event loop and whoever decides the
/// server should stop (the termination signal handler, tests).
///
/// Triggering writes a byte into a socket pair whose read end sits in the
/// loop's readiness set, so a loop blocked in `poll` wakes up right away.
#[derive(Clone, Debug)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    is_shutdown: AtomicBool,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
}

impl Shutdown {
    pub fn new() -> Result<Self, ServerError> {
        let (wake_tx, wake_rx) = UnixStream::pair().context(WakerSnafu)?;
        wake_tx.set_nonblocking(true).context(WakerSnafu)?;
        wake_rx.set_nonblocking(true).context(WakerSnafu)?;
        Ok(Self {
            inner: Arc::new(Inner {
                is_shutdown: AtomicBool::new(false),
                wake_tx,
                wake_rx,
            }),
        })
    }

    /// Trigger shutdown exactly once. Subsequent calls are no-ops.
    pub fn trigger(&self) {
        if !self.inner.is_shutdown.swap(true, Ordering::SeqCst) {
            // a full socket buffer means the loop is already awake
            let _ = (&self.inner.wake_tx).write(&[1]);
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn waker(&self) -> BorrowedFd<'_> {
        self.inner.wake_rx.as_fd()
    }

    pub(crate) fn drain_wakeups(&self) {
        let mut buf = [0u8; 16];
        while matches!((&self.inner.wake_rx).read(&mut buf), Ok(n) if n > 0) {}
    }
}

#[cfg(test)]
mod tests {
    use rustix::event::{PollFd, PollFlags, Timespec, poll};

    use super::*;

    fn readable(shutdown: &Shutdown) -> bool {
        let mut fds = [PollFd::from_borrowed_fd(shutdown.waker(), PollFlags::IN)];
        let zero = Timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        poll(&mut fds, Some(&zero)).unwrap();
        fds[0].revents().contains(PollFlags::IN)
    }

    #[test]
    fn test_trigger_wakes_once() {
        let shutdown = Shutdown::new().unwrap();
        let other = shutdown.clone();
        assert!(!shutdown.is_shutdown());
        assert!(!readable(&shutdown));

        other.trigger();
        other.trigger();
        assert!(shutdown.is_shutdown());
        assert!(readable(&shutdown));

        shutdown.drain_wakeups();
        assert!(!readable(&shutdown));
        assert!(shutdown.is_shutdown());
    }
}
