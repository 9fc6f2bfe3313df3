//! Turns client commands into registry and connection table changes, and
//! keeps the watch relation between the two consistent.

use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use bstr::ByteSlice as _;
use jobprotocol::{Broadcast, Command, JobPid, ParseError, Reply};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection_table::{ConnectionId, ConnectionTable},
    job_registry::{
        ExitMarker, JobRegistry, KillError, Liveness, SpawnError, StreamKind,
    },
};

/// How long each client gets to accept the shutdown notice.
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct Dispatcher {
    pub jobs: JobRegistry,
    pub clients: ConnectionTable,
    jobs_dir: PathBuf,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            jobs: JobRegistry::new(config.max_jobs, config.max_line),
            clients: ConnectionTable::new(config.max_clients, config.max_line),
            jobs_dir: config.jobs_dir.clone(),
        }
    }

    #[must_use]
    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Handles one complete command line from `from`.
    pub fn dispatch(&mut self, from: ConnectionId, frame: &[u8]) {
        let line = frame.to_str_lossy();
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(ParseError::Empty) => return,
            Err(e) => {
                info!("[CLIENT {from}] invalid command {line:?}: {e}");
                self.reply(
                    from,
                    Reply::InvalidCommand {
                        line: line.trim().to_string(),
                        reason: e.to_string(),
                    },
                );
                return;
            }
        };
        info!(verb = %command.verb(), "[CLIENT {from}] {}", line.trim());

        match command {
            Command::Jobs => self.list_jobs(from),
            Command::Run { path, args } => self.run_job(from, &path, &args),
            Command::Kill { pid } => self.kill_job(from, pid),
            Command::Watch { pid } => self.watch_job(from, pid),
        }
    }

    pub fn reply(&mut self, to: ConnectionId, reply: Reply) {
        self.clients.send(to, &reply.into_bytes());
    }

    fn list_jobs(&mut self, from: ConnectionId) {
        let pids = self.jobs.list();
        let reply = if pids.is_empty() {
            Reply::NoJobs
        } else {
            Reply::JobList(pids)
        };
        self.reply(from, reply);
    }

    fn run_job(&mut self, from: ConnectionId, path: &str, args: &[String]) {
        if self.jobs.is_full() {
            self.reply(from, Reply::MaxJobsExceeded);
            return;
        }
        let Some(executable) = resolve_executable(&self.jobs_dir, path) else {
            self.reply(
                from,
                Reply::InvalidCommand {
                    line: format!("run {path}"),
                    reason: "job names must stay inside the jobs directory"
                        .to_string(),
                },
            );
            return;
        };

        let reply = match self.jobs.spawn(&executable, args) {
            Ok(job) => Reply::JobCreated(job.pid()),
            Err(SpawnError::AtCapacity { .. }) => Reply::MaxJobsExceeded,
            Err(SpawnError::NotFound { .. }) => {
                Reply::ExecutableNotFound(path.to_string())
            }
            Err(e @ SpawnError::Spawn { .. }) => {
                warn!("could not start {}: {e}", executable.display());
                Reply::SpawnFailed {
                    path: path.to_string(),
                    reason: e.to_string(),
                }
            }
        };
        self.reply(from, reply);
    }

    /// A successful kill sends nothing back to the requester; watchers
    /// (possibly including it) get the kill notice.
    fn kill_job(&mut self, from: ConnectionId, pid: JobPid) {
        match self.kill_and_evict(pid) {
            Ok(()) => {}
            Err(KillError::NotRegistered { .. }) => {
                self.reply(from, Reply::JobNotFound(pid));
            }
            Err(e @ KillError::Signal { .. }) => {
                warn!("could not kill job {pid}: {e}");
                self.reply(
                    from,
                    Reply::KillFailed {
                        pid,
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    fn watch_job(&mut self, from: ConnectionId, pid: JobPid) {
        let Some(job) = self.jobs.find_mut(pid) else {
            self.reply(from, Reply::JobNotFound(pid));
            return;
        };
        if self.clients.watch(from, pid) {
            job.add_watcher(from);
            debug!("[CLIENT {from}] watching job {pid}");
        }
    }

    /// Sends `msg` to every client watching the job it is about.
    pub fn broadcast(&mut self, msg: &Broadcast) {
        let Some(job) = self.jobs.find(msg.pid()) else {
            return;
        };
        if job.watchers().is_empty() {
            return;
        }
        let bytes = msg.to_bytes();
        for id in job.watchers() {
            self.clients.send(*id, &bytes);
        }
    }

    /// Forwards one line of job output to its watchers.
    pub fn job_output(&mut self, pid: JobPid, kind: StreamKind, line: Vec<u8>) {
        debug!("[JOB {pid}] {kind}: {}", line.as_bstr());
        let msg = match kind {
            StreamKind::Stdout => Broadcast::Stdout { pid, line },
            StreamKind::Stderr => Broadcast::Stderr { pid, line },
        };
        self.broadcast(&msg);
    }

    /// Kills a job that printed a line longer than the line buffer.
    pub fn abort_job(&mut self, pid: JobPid) {
        warn!("job {pid} overflowed its output buffer, aborting");
        self.broadcast(&Broadcast::Aborted { pid });
        if let Err(e) = self.kill_and_evict(pid) {
            warn!("could not abort job {pid}: {e}");
        }
    }

    fn kill_and_evict(&mut self, pid: JobPid) -> Result<(), KillError> {
        self.jobs.kill(pid)?;
        self.jobs.mark_dead(pid, ExitMarker::Killed);
        self.evict(pid);
        Ok(())
    }

    /// Unregisters a job, tells its watchers how it ended unless they heard
    /// already, and removes it from their watch sets.
    fn evict(&mut self, pid: JobPid) {
        let Ok(removed) = self.jobs.remove(pid) else {
            return;
        };
        let notice = match removed.liveness {
            Liveness::Dead(marker) if !removed.exit_reported => {
                Some(exit_notice(pid, marker))
            }
            _ => None,
        };
        let bytes = notice.map(|msg| msg.to_bytes());
        for id in &removed.watchers {
            if let Some(bytes) = &bytes {
                self.clients.send(*id, bytes);
            }
            self.clients.unwatch(*id, pid);
        }
    }

    /// Notes jobs whose process ended and tells watchers once a dead job's
    /// output has been fully delivered. Finished jobs stay registered.
    pub fn retire_finished(&mut self) {
        for (pid, marker) in self.jobs.reap() {
            if let Some(job) = self.jobs.find(pid) {
                info!("job {pid} ({}) {marker}", job.executable().display());
            }
        }
        for (pid, marker) in self.jobs.take_finished() {
            self.broadcast(&exit_notice(pid, marker));
        }
    }

    /// Closes a client and drops it from the watchers of every job.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let watching = self.clients.unwatch_all(id);
        for pid in watching {
            if let Some(job) = self.jobs.find_mut(pid) {
                job.remove_watcher(id);
            }
        }
        if let Some(client) = self.clients.drop_connection(id) {
            info!("[CLIENT {id}] {} disconnected", client.peer());
        }
    }

    pub fn drop_broken(&mut self) {
        for id in self.clients.broken() {
            self.disconnect(id);
        }
    }

    /// Tells every client the server is going away, closes them all and
    /// kills every job.
    pub fn shutdown(&mut self) {
        let notice = Reply::ShuttingDown.into_bytes();
        for (id, mut client) in self.clients.drain() {
            client.send(&notice);
            client.flush_with_timeout(SHUTDOWN_FLUSH);
            debug!("[CLIENT {id}] closed on shutdown");
        }
        self.jobs.shutdown();
    }
}

fn exit_notice(pid: JobPid, marker: ExitMarker) -> Broadcast {
    match marker {
        ExitMarker::Killed => Broadcast::Killed { pid },
        ExitMarker::Exited { code } => Broadcast::Exited { pid, code },
        ExitMarker::Signalled { signal } => {
            Broadcast::Signalled { pid, signal }
        }
    }
}

/// Maps a job name from a `run` command into the jobs directory. Names that
/// are absolute or climb out with `..` resolve to nothing.
fn resolve_executable(jobs_dir: &Path, name: &str) -> Option<PathBuf> {
    let name = Path::new(name);
    let mut components = name.components().peekable();
    components.peek()?;
    components
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then(|| jobs_dir.join(name))
}
