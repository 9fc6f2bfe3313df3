//! Text the server sends back.
//!
//! Replies to a client command end in a network newline. Lines broadcast to
//! watchers end in a bare `\n` and carry the job's raw output bytes.

use std::fmt;

use crate::command::JobPid;

/// A direct answer to the client that sent a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    NoJobs,
    JobList(Vec<JobPid>),
    JobCreated(JobPid),
    MaxJobsExceeded,
    JobNotFound(JobPid),
    ExecutableNotFound(String),
    SpawnFailed { path: String, reason: String },
    KillFailed { pid: JobPid, reason: String },
    InvalidCommand { line: String, reason: String },
    CommandTooLong,
    ServerFull,
    ShuttingDown,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::NoJobs => write!(f, "No currently running jobs")?,
            Reply::JobList(pids) => {
                let mut pids = pids.iter();
                if let Some(first) = pids.next() {
                    write!(f, "{first}")?;
                }
                for pid in pids {
                    write!(f, " {pid}")?;
                }
            }
            Reply::JobCreated(pid) => write!(f, "Job {pid} created")?,
            Reply::MaxJobsExceeded => write!(f, "MAXJOBS exceeded")?,
            Reply::JobNotFound(pid) => write!(f, "Job {pid} not found")?,
            Reply::ExecutableNotFound(path) => {
                write!(f, "Job {path} could not be found")?;
            }
            Reply::SpawnFailed { path, reason } => {
                write!(f, "Job {path} could not be created: {reason}")?;
            }
            Reply::KillFailed { pid, reason } => {
                write!(f, "Job {pid} could not be killed: {reason}")?;
            }
            Reply::InvalidCommand { line, reason } => {
                write!(f, "Invalid command: {line} ({reason})")?;
            }
            Reply::CommandTooLong => {
                write!(f, "Command too long, closing connection")?;
            }
            Reply::ServerFull => write!(f, "Server is full")?,
            Reply::ShuttingDown => write!(f, "Shutting down")?,
        }
        f.write_str("\r\n")
    }
}

impl Reply {
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

/// Something every watcher of a job receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    Stdout { pid: JobPid, line: Vec<u8> },
    Stderr { pid: JobPid, line: Vec<u8> },
    Exited { pid: JobPid, code: i32 },
    Signalled { pid: JobPid, signal: i32 },
    Killed { pid: JobPid },
    /// The job's output buffer filled without a newline.
    Aborted { pid: JobPid },
}

impl Broadcast {
    #[must_use]
    pub fn pid(&self) -> JobPid {
        match self {
            Broadcast::Stdout { pid, .. }
            | Broadcast::Stderr { pid, .. }
            | Broadcast::Exited { pid, .. }
            | Broadcast::Signalled { pid, .. }
            | Broadcast::Killed { pid }
            | Broadcast::Aborted { pid } => *pid,
        }
    }

    /// Output lines are copied verbatim, they need not be UTF-8.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = match self {
            Broadcast::Stdout { pid, .. } => format!("[JOB {pid}] "),
            Broadcast::Stderr { pid, .. } => format!("*(JOB {pid})* "),
            Broadcast::Exited { pid, code } => {
                format!("[JOB {pid}] Exited with status {code}")
            }
            Broadcast::Signalled { pid, signal } => {
                format!("[JOB {pid}] Exited due to signal {signal}")
            }
            Broadcast::Killed { pid } => format!("[JOB {pid}] Killed"),
            Broadcast::Aborted { pid } => format!(
                "*(SERVER)* Buffer from job {pid} is full. Aborting job."
            ),
        };
        let body = match self {
            Broadcast::Stdout { line, .. } | Broadcast::Stderr { line, .. } => {
                line.as_slice()
            }
            _ => &[],
        };
        let mut out = Vec::with_capacity(head.len() + body.len() + 1);
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(body);
        out.push(b'\n');
        out
    }
}
