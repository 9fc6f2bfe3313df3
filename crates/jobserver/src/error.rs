use std::{backtrace::Backtrace, net::SocketAddr, path::PathBuf};

use snafu::Snafu;

/// Failures that stop the server. Per-command and per-connection problems
/// never surface here, they are answered or logged where they happen.
#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum ServerError {
    #[snafu(display("could not bind {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("could not configure the listening socket: {source}"))]
    ListenerSetup {
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("could not create the wake-up socket pair: {source}"))]
    Waker {
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("waiting for readiness failed: {source}"))]
    Poll {
        source: rustix::io::Errno,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("could not open log file {}: {source}", path.display()))]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
}
