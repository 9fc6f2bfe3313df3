//! The single-threaded reactor.
//!
//! Every iteration rebuilds the readiness set from the current state (the
//! wake-up socket, the listener, every client, every open job pipe and
//! every live job's exit handle), blocks in `poll` until something is
//! ready, then services the ready sources in that order. Jobs are retired
//! and broken clients dropped at the end of each iteration.

use std::{
    io,
    net::{SocketAddr, TcpListener},
};

use jobprotocol::{FrameError, JobPid, Reply};
use rustix::{
    event::{PollFd, PollFlags, poll},
    io::Errno,
};
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection_table::{ClientRead, ConnectionId},
    dispatcher::Dispatcher,
    error::{BindSnafu, ListenerSetupSnafu, PollSnafu, ServerError},
    job_registry::StreamKind,
    shutdown::Shutdown,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Waker,
    Listener,
    Client(ConnectionId),
    Pipe(JobPid, StreamKind),
    Exit(JobPid),
}

#[derive(Debug)]
pub struct EventLoop {
    listener: TcpListener,
    dispatcher: Dispatcher,
    shutdown: Shutdown,
}

impl EventLoop {
    /// Binds the listening socket. Nothing is accepted until [`Self::run`].
    pub fn bind(
        config: &ServerConfig,
        shutdown: Shutdown,
    ) -> Result<Self, ServerError> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr).context(BindSnafu { addr })?;
        listener.set_nonblocking(true).context(ListenerSetupSnafu)?;
        Ok(Self {
            listener,
            dispatcher: Dispatcher::new(config),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until the shutdown token fires or waiting for readiness fails.
    /// Either way clients are told and closed, and all jobs are killed
    /// before this returns.
    pub fn run(mut self) -> Result<(), ServerError> {
        match self.local_addr() {
            Ok(addr) => info!(
                "listening on {addr}, jobs from {}",
                self.dispatcher.jobs_dir().display()
            ),
            Err(e) => warn!("listening on an unknown address: {e}"),
        }
        let result = self.serve();
        if let Err(e) = &result {
            warn!("event loop failed: {e}");
        }
        self.teardown();
        result
    }

    fn serve(&mut self) -> Result<(), ServerError> {
        while !self.shutdown.is_shutdown() {
            let ready = self.wait()?;
            for (source, flags) in ready {
                self.service(source, flags);
            }
            self.dispatcher.retire_finished();
            self.dispatcher.drop_broken();
        }
        info!("shutdown requested");
        Ok(())
    }

    /// Blocks until at least one source is ready. Returns them in the order
    /// they must be serviced; empty if the wait was interrupted.
    fn wait(&self) -> Result<Vec<(Source, PollFlags)>, ServerError> {
        let mut sources = vec![Source::Waker, Source::Listener];
        let mut fds = vec![
            PollFd::from_borrowed_fd(self.shutdown.waker(), PollFlags::IN),
            PollFd::new(&self.listener, PollFlags::IN),
        ];

        for (id, client) in self.dispatcher.clients.iter() {
            let mut events = PollFlags::IN;
            if client.wants_write() {
                events |= PollFlags::OUT;
            }
            sources.push(Source::Client(id));
            fds.push(PollFd::new(client.stream(), events));
        }

        for job in self.dispatcher.jobs.iter() {
            for kind in [StreamKind::Stdout, StreamKind::Stderr] {
                if let Some(pipe) = job.stream(kind).pipe() {
                    sources.push(Source::Pipe(job.pid(), kind));
                    fds.push(PollFd::from_borrowed_fd(pipe, PollFlags::IN));
                }
            }
        }
        for job in self.dispatcher.jobs.iter() {
            if let Some(handle) = job.exit_handle() {
                sources.push(Source::Exit(job.pid()));
                fds.push(PollFd::from_borrowed_fd(handle, PollFlags::IN));
            }
        }

        if let Err(err) = poll(&mut fds, None) {
            if err == Errno::INTR {
                return Ok(Vec::new());
            }
            return Err(err).context(PollSnafu);
        }

        Ok(sources
            .into_iter()
            .zip(&fds)
            .filter_map(|(source, fd)| {
                let revents = fd.revents();
                (!revents.is_empty()).then_some((source, revents))
            })
            .collect())
    }

    fn service(&mut self, source: Source, flags: PollFlags) {
        match source {
            Source::Waker => self.shutdown.drain_wakeups(),
            Source::Listener => self.accept_clients(),
            Source::Client(id) => self.service_client(id, flags),
            Source::Pipe(pid, kind) => self.service_pipe(pid, kind),
            // statuses are collected by retire_finished after this pass
            Source::Exit(pid) => debug!("job {pid} exit noticed"),
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    match self.dispatcher.clients.admit(stream, peer) {
                        Ok(id) => info!("[CLIENT {id}] connected from {peer}"),
                        Err(e) => warn!("turned away {peer}: {e}"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn service_client(&mut self, id: ConnectionId, flags: PollFlags) {
        let Some(client) = self.dispatcher.clients.get_mut(id) else {
            // dropped earlier in this iteration
            return;
        };
        if flags.contains(PollFlags::OUT) {
            client.flush();
        }
        let readable = PollFlags::IN | PollFlags::HUP | PollFlags::ERR;
        if !flags.intersects(readable) {
            return;
        }

        match client.read_frames() {
            Ok(ClientRead::Frames(frames)) => {
                for frame in frames {
                    self.dispatcher.dispatch(id, &frame);
                }
            }
            Ok(ClientRead::Closed) => self.dispatcher.disconnect(id),
            Err(FrameError::Overflow(e)) => {
                warn!("[CLIENT {id}] {e}, closing");
                self.dispatcher.reply(id, Reply::CommandTooLong);
                self.dispatcher.disconnect(id);
            }
            Err(FrameError::Io(e)) => {
                debug!("[CLIENT {id}] read failed: {e}");
                self.dispatcher.disconnect(id);
            }
        }
    }

    fn service_pipe(&mut self, pid: JobPid, kind: StreamKind) {
        let Some(job) = self.dispatcher.jobs.find_mut(pid) else {
            return;
        };
        match job.stream_mut(kind).read_lines() {
            Ok(read) => {
                for line in read.lines {
                    self.dispatcher.job_output(pid, kind, line);
                }
                if read.closed {
                    debug!("job {pid} closed its {kind}");
                }
            }
            Err(FrameError::Overflow(_)) => self.dispatcher.abort_job(pid),
            Err(FrameError::Io(e)) => {
                warn!("reading {kind} of job {pid} failed: {e}");
                job.stream_mut(kind).close();
            }
        }
    }

    fn teardown(&mut self) {
        info!(
            "closing {} clients and stopping {} jobs",
            self.dispatcher.clients.len(),
            self.dispatcher.jobs.count()
        );
        self.dispatcher.shutdown();
    }
}
