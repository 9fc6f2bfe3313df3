use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use jobprotocol::DEFAULT_MAX_LINE;

pub const DEFAULT_PORT: u16 = 55555;
pub const DEFAULT_JOBS_DIR: &str = "jobs/";
pub const DEFAULT_MAX_JOBS: usize = 32;
pub const DEFAULT_MAX_CLIENTS: usize = 20;

/// Everything the server needs to start. Built from [`crate::cli::Args`] by
/// the binary, or directly by tests.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// 0 lets the OS pick a port.
    pub port: u16,
    /// `run <name>` only ever executes `jobs_dir/<name>`.
    pub jobs_dir: PathBuf,
    pub max_jobs: usize,
    pub max_clients: usize,
    /// Capacity of every client and job-pipe line buffer.
    pub max_line: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            jobs_dir: PathBuf::from(DEFAULT_JOBS_DIR),
            max_jobs: DEFAULT_MAX_JOBS,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_line: DEFAULT_MAX_LINE,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}
