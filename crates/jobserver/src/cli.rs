use std::{net::IpAddr, path::PathBuf};

use clap::builder::RangedU64ValueParser;
use jobprotocol::DEFAULT_MAX_LINE;

use crate::config::{
    DEFAULT_JOBS_DIR, DEFAULT_MAX_CLIENTS, DEFAULT_MAX_JOBS, DEFAULT_PORT,
    ServerConfig,
};

static HELP_STR_JOBS_DIR: &str = "
    Directory that `run <name>` resolves executables in. Names that would \
                                  escape it (absolute paths, `..`) are \
                                  rejected. Example value: \"jobs/\"
";

#[derive(clap::Parser, Debug)]
#[command(
    name = "jobserver",
    version,
    about = "jobserver",
    long_about = "A job server: clients connect over TCP to start, list, \
                  kill and watch jobs. Every line a job prints is streamed \
                  to the clients watching it"
)]
pub struct Args {
    #[arg(
        long,
        short = 'a',
        value_name = "ADDR",
        help = "Address to listen on",
        default_value = "127.0.0.1"
    )]
    pub bind_addr: IpAddr,

    #[arg(
        long,
        short,
        value_name = "PORT",
        help = "TCP port to listen on",
        default_value_t = DEFAULT_PORT
    )]
    pub port: u16,

    #[arg(
        long,
        short,
        value_name = "JOBS_DIR",
        help = HELP_STR_JOBS_DIR,
        default_value = DEFAULT_JOBS_DIR
    )]
    pub jobs_dir: PathBuf,

    #[arg(
        long,
        value_name = "N",
        help = "Maximum number of concurrent jobs",
        default_value_t = DEFAULT_MAX_JOBS
    )]
    pub max_jobs: usize,

    #[arg(
        long,
        value_name = "N",
        help = "Maximum number of connected clients",
        default_value_t = DEFAULT_MAX_CLIENTS
    )]
    pub max_clients: usize,

    #[arg(
        long,
        value_name = "BYTES",
        help = "Longest command or job output line, newline included",
        default_value_t = DEFAULT_MAX_LINE,
        value_parser = RangedU64ValueParser::<usize>::new().range(2..)
    )]
    pub max_line: usize,

    #[arg(
        long,
        short = 'l',
        value_name = "LOG_PATH",
        help = "Optional log path value. If not provided, logs go to stderr"
    )]
    pub log_path: Option<PathBuf>,
}

impl From<&Args> for ServerConfig {
    fn from(args: &Args) -> Self {
        ServerConfig {
            bind_addr: args.bind_addr,
            port: args.port,
            jobs_dir: args.jobs_dir.clone(),
            max_jobs: args.max_jobs,
            max_clients: args.max_clients,
            max_line: args.max_line,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let args = Args::parse_from(["jobserver"]);
        let config = ServerConfig::from(&args);
        let default = ServerConfig::default();
        assert_eq!(config.socket_addr(), default.socket_addr());
        assert_eq!(config.jobs_dir, default.jobs_dir);
        assert_eq!(config.max_jobs, default.max_jobs);
        assert_eq!(config.max_clients, default.max_clients);
        assert_eq!(config.max_line, default.max_line);
        assert!(args.log_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "jobserver",
            "-p",
            "4000",
            "-j",
            "/srv/jobs",
            "--max-jobs",
            "3",
            "--max-line",
            "64",
            "-l",
            "/tmp/jobserver.log",
        ]);
        let config = ServerConfig::from(&args);
        assert_eq!(config.port, 4000);
        assert_eq!(config.jobs_dir, PathBuf::from("/srv/jobs"));
        assert_eq!(config.max_jobs, 3);
        assert_eq!(config.max_line, 64);
        assert_eq!(args.log_path, Some(PathBuf::from("/tmp/jobserver.log")));
    }

    #[test]
    fn test_rejects_tiny_line_buffer() {
        assert!(Args::try_parse_from(["jobserver", "--max-line", "1"]).is_err());
    }
}
