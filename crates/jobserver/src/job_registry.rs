//! Child processes started for clients and everything needed to service them.

use std::{
    collections::BTreeSet,
    fmt,
    fs::File,
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use indexmap::{IndexMap, map::Entry};
use jobprotocol::{FrameError, FramedBuffer, JobPid, Newline, ReadStatus};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info, warn};

use crate::connection_table::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// How a job stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMarker {
    /// SIGKILL was sent by the server; the status has not been collected.
    Killed,
    /// The process returned `code`.
    Exited { code: i32 },
    /// The process was terminated by `signal` from somewhere else.
    Signalled { signal: i32 },
}

impl fmt::Display for ExitMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitMarker::Killed => f.write_str("killed by the server"),
            ExitMarker::Exited { code } => {
                write!(f, "exited with status {code}")
            }
            ExitMarker::Signalled { signal } => {
                write!(f, "terminated by signal {signal}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead(ExitMarker),
}

/// One output pipe of a job plus the partial line read from it so far.
#[derive(Debug)]
pub struct JobStream {
    // None once the pipe reached end of file or was closed by us
    pipe: Option<File>,
    buffer: FramedBuffer,
}

/// Lines pulled out of a [`JobStream`] by one read.
#[derive(Debug, Default)]
pub struct StreamRead {
    pub lines: Vec<Vec<u8>>,
    /// The pipe hit end of file. Any unterminated tail is the last entry in
    /// `lines`.
    pub closed: bool,
}

impl JobStream {
    fn new(pipe: Option<OwnedFd>, max_line: usize) -> Self {
        let pipe = pipe.map(|fd| {
            if let Err(e) = rustix::io::ioctl_fionbio(&fd, true) {
                warn!("could not make job pipe non-blocking: {e}");
            }
            File::from(fd)
        });
        Self {
            pipe,
            buffer: FramedBuffer::new(max_line, Newline::Unix),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    #[must_use]
    pub fn pipe(&self) -> Option<BorrowedFd<'_>> {
        self.pipe.as_ref().map(AsFd::as_fd)
    }

    /// Reads once from the pipe and returns every complete line.
    ///
    /// On end of file the pipe is closed and pending bytes are returned as a
    /// final line. An [`FrameError::Overflow`] means a line longer than the
    /// buffer; the stream is left untouched and the caller decides.
    pub fn read_lines(&mut self) -> Result<StreamRead, FrameError> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(StreamRead {
                lines: Vec::new(),
                closed: true,
            });
        };
        let status = self.buffer.read_from(pipe)?;

        let mut read = StreamRead::default();
        while let Some(line) = self.buffer.take_frame() {
            read.lines.push(line);
        }
        if status == ReadStatus::Closed {
            read.lines.extend(self.buffer.take_remainder());
            self.pipe = None;
            read.closed = true;
        }
        Ok(read)
    }

    pub fn close(&mut self) {
        self.pipe = None;
        self.buffer.clear();
    }
}

#[derive(Debug)]
pub struct Job {
    pid: JobPid,
    executable: PathBuf,
    child: Child,
    // readable once the process exits; dropped once the exit is seen
    exit_handle: Option<OwnedFd>,
    stdout: JobStream,
    stderr: JobStream,
    liveness: Liveness,
    exit_reported: bool,
    watchers: BTreeSet<ConnectionId>,
}

impl Job {
    #[must_use]
    pub fn pid(&self) -> JobPid {
        self.pid
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness == Liveness::Alive
    }

    #[must_use]
    pub fn stream(&self, kind: StreamKind) -> &JobStream {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    pub fn stream_mut(&mut self, kind: StreamKind) -> &mut JobStream {
        match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Becomes readable when the process exits. `None` once the job is dead,
    /// or when the platform gave us no such handle.
    #[must_use]
    pub fn exit_handle(&self) -> Option<BorrowedFd<'_>> {
        if !self.is_alive() {
            return None;
        }
        self.exit_handle.as_ref().map(AsFd::as_fd)
    }

    /// Both pipes reached end of file or were closed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        !self.stdout.is_open() && !self.stderr.is_open()
    }

    #[must_use]
    pub fn watchers(&self) -> &BTreeSet<ConnectionId> {
        &self.watchers
    }

    pub fn add_watcher(&mut self, id: ConnectionId) -> bool {
        self.watchers.insert(id)
    }

    pub fn remove_watcher(&mut self, id: ConnectionId) -> bool {
        self.watchers.remove(&id)
    }

    /// The process terminated on its own and is held as a zombie.
    fn has_exited(&self) -> bool {
        matches!(
            self.liveness,
            Liveness::Dead(
                ExitMarker::Exited { .. } | ExitMarker::Signalled { .. }
            )
        )
    }
}

/// What is left of a job after [`JobRegistry::remove`].
#[derive(Debug)]
pub struct RemovedJob {
    pub pid: JobPid,
    pub liveness: Liveness,
    /// Watchers were already told how the job ended.
    pub exit_reported: bool,
    pub watchers: BTreeSet<ConnectionId>,
}

#[derive(Debug, Snafu)]
pub enum SpawnError {
    #[snafu(display("job limit of {max_jobs} reached"))]
    AtCapacity { max_jobs: usize },
    #[snafu(display("{} is not an executable file", path.display()))]
    NotFound { path: PathBuf },
    #[snafu(display("{source}"))]
    Spawn { path: PathBuf, source: io::Error },
}

#[derive(Debug, Snafu)]
pub enum KillError {
    #[snafu(display("job {pid} is not registered"))]
    NotRegistered { pid: JobPid },
    #[snafu(display("{source}"))]
    Signal {
        pid: JobPid,
        source: nix::errno::Errno,
    },
}

#[derive(Debug, Snafu)]
#[snafu(display("job {pid} is not registered"))]
pub struct JobNotFound {
    pub pid: JobPid,
}

/// Every job the server currently knows about, in spawn order.
///
/// A job stays registered after its process ends, until it is removed.
/// Registered processes are never reaped: an exited one is left a zombie,
/// so its pid cannot be handed to another process while the entry exists.
/// Signals and new spawns therefore never meet a recycled pid.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: IndexMap<JobPid, Job>,
    max_jobs: usize,
    max_line: usize,
    // removed jobs whose status was never collected
    unreaped: Vec<Child>,
}

impl JobRegistry {
    #[must_use]
    pub fn new(max_jobs: usize, max_line: usize) -> Self {
        Self {
            jobs: IndexMap::new(),
            max_jobs,
            max_line,
            unreaped: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    /// Starts `executable` with `args`, stdin closed and both output streams
    /// piped back to us.
    pub fn spawn(
        &mut self,
        executable: &Path,
        args: &[String],
    ) -> Result<&Job, SpawnError> {
        ensure!(
            !self.is_full(),
            AtCapacitySnafu {
                max_jobs: self.max_jobs
            }
        );
        ensure!(executable.is_file(), NotFoundSnafu { path: executable });

        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(SpawnSnafu { path: executable })?;

        let pid = JobPid(child.id());
        let stdout = child.stdout.take().map(OwnedFd::from);
        let stderr = child.stderr.take().map(OwnedFd::from);
        let job = Job {
            pid,
            executable: executable.to_path_buf(),
            exit_handle: open_exit_handle(&child),
            child,
            stdout: JobStream::new(stdout, self.max_line),
            stderr: JobStream::new(stderr, self.max_line),
            liveness: Liveness::Alive,
            exit_reported: false,
            watchers: BTreeSet::new(),
        };
        info!("job {pid} started: {}", executable.display());
        match self.jobs.entry(pid) {
            Entry::Vacant(slot) => Ok(slot.insert(job)),
            Entry::Occupied(mut slot) => {
                // only possible if a registered process was reaped behind
                // our back
                warn!("job {pid} replaces a stale entry with the same pid");
                let stale = slot.insert(job);
                self.unreaped.push(stale.child);
                Ok(slot.into_mut())
            }
        }
    }

    #[must_use]
    pub fn find(&self, pid: JobPid) -> Option<&Job> {
        self.jobs.get(&pid)
    }

    pub fn find_mut(&mut self, pid: JobPid) -> Option<&mut Job> {
        self.jobs.get_mut(&pid)
    }

    /// Sends SIGKILL to a registered job. A job whose process already ended
    /// is left alone.
    pub fn kill(&mut self, pid: JobPid) -> Result<(), KillError> {
        let job = self.jobs.get(&pid).context(NotRegisteredSnafu { pid })?;
        if job.has_exited() {
            debug!("job {pid} already exited, not signalling");
            return Ok(());
        }
        kill(Pid::from_raw(*pid as libc::pid_t), Signal::SIGKILL)
            .context(SignalSnafu { pid })?;
        info!("sent SIGKILL to job {pid}");
        Ok(())
    }

    /// Moves a live job to `Dead(marker)`. Returns false if the job is
    /// unknown or already dead.
    pub fn mark_dead(&mut self, pid: JobPid, marker: ExitMarker) -> bool {
        match self.jobs.get_mut(&pid) {
            Some(job) if job.is_alive() => {
                job.liveness = Liveness::Dead(marker);
                true
            }
            _ => false,
        }
    }

    /// Unregisters a job, closing its pipes. The process is reaped by the
    /// next [`Self::reap`], which releases its pid.
    pub fn remove(&mut self, pid: JobPid) -> Result<RemovedJob, JobNotFound> {
        let Job {
            child,
            liveness,
            exit_reported,
            watchers,
            ..
        } = self
            .jobs
            .shift_remove(&pid)
            .context(JobNotFoundSnafu { pid })?;
        self.unreaped.push(child);
        debug!("job {pid} unregistered");
        Ok(RemovedJob {
            pid,
            liveness,
            exit_reported,
            watchers,
        })
    }

    /// Pids of every registered job in spawn order, finished ones included.
    #[must_use]
    pub fn list(&self) -> Vec<JobPid> {
        self.jobs.keys().copied().collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.jobs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Notes every registered job whose process ended, without blocking
    /// and without releasing its pid. Processes of removed jobs are reaped
    /// for good. Returns the jobs found dead by this call.
    pub fn reap(&mut self) -> Vec<(JobPid, ExitMarker)> {
        self.unreaped
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));

        let mut exited = Vec::new();
        for job in self.jobs.values_mut() {
            if job.has_exited() {
                continue;
            }
            match peek_exit(&job.child) {
                Ok(Some(marker)) => {
                    job.liveness = Liveness::Dead(marker);
                    job.exit_handle = None;
                    exited.push((job.pid, marker));
                }
                Ok(None) => {}
                Err(e) => warn!("could not check on job {}: {e}", job.pid),
            }
        }
        exited
    }

    /// Dead jobs whose output has been fully read and whose end was not
    /// handed out before. Each job is returned at most once; it stays
    /// registered until removed.
    pub fn take_finished(&mut self) -> Vec<(JobPid, ExitMarker)> {
        let mut finished = Vec::new();
        for job in self.jobs.values_mut() {
            if job.exit_reported || !job.is_drained() {
                continue;
            }
            if let Liveness::Dead(marker) = job.liveness {
                job.exit_reported = true;
                finished.push((job.pid, marker));
            }
        }
        finished
    }

    /// Kills every job still running and waits for all of them.
    pub fn shutdown(&mut self) {
        for (pid, mut job) in self.jobs.drain(..) {
            if !job.has_exited() {
                if let Err(e) = job.child.kill() {
                    debug!("job {pid} could not be killed on shutdown: {e}");
                }
            }
            if let Err(e) = job.child.wait() {
                warn!("could not reap job {pid}: {e}");
            }
        }
        for mut child in self.unreaped.drain(..) {
            let pid = child.id();
            if let Err(e) = child.kill() {
                debug!("removed job {pid} could not be killed: {e}");
            }
            if let Err(e) = child.wait() {
                debug!("could not reap removed job {pid}: {e}");
            }
        }
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Looks at the exit status of `child` while leaving it waitable.
fn peek_exit(child: &Child) -> rustix::io::Result<Option<ExitMarker>> {
    use rustix::process::{Pid, WaitId, WaitIdOptions, waitid};

    let options =
        WaitIdOptions::EXITED | WaitIdOptions::NOHANG | WaitIdOptions::NOWAIT;
    let Some(status) = waitid(WaitId::Pid(Pid::from_child(child)), options)?
    else {
        return Ok(None);
    };
    Ok(match (status.exit_status(), status.terminating_signal()) {
        (Some(code), _) => Some(ExitMarker::Exited { code }),
        (None, Some(signal)) => Some(ExitMarker::Signalled { signal }),
        (None, None) => None,
    })
}

#[cfg(target_os = "linux")]
fn open_exit_handle(child: &Child) -> Option<OwnedFd> {
    use rustix::process::{Pid, PidfdFlags, pidfd_open};

    match pidfd_open(Pid::from_child(child), PidfdFlags::empty()) {
        Ok(fd) => Some(fd),
        Err(e) => {
            warn!("no pidfd for job {}, exits noticed late: {e}", child.id());
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn open_exit_handle(_child: &Child) -> Option<OwnedFd> {
    None
}
