use std::{fs::File, path::Path};

use snafu::ResultExt;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::error::{LogFileSnafu, ServerError};

/// Installs the global subscriber. Logs go to `log_path` when given,
/// otherwise to stderr. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(log_path: Option<&Path>) -> Result<(), ServerError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = log_path {
        let file = File::create(path).context(LogFileSnafu { path })?;
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
    }
    Ok(())
}
