use clap::Parser;
use eyre::WrapErr;
use jobserver::{
    cli::Args, config::ServerConfig, event_loop::EventLoop,
    shutdown::Shutdown, tracing_init::init_tracing,
};
use mimalloc::MiMalloc;
use tracing::error;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_path.as_deref())?;
    let config = ServerConfig::from(&args);

    let shutdown = Shutdown::new()?;
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || on_signal.trigger())
        .wrap_err("could not install the termination handler")?;

    let server = EventLoop::bind(&config, shutdown)?;
    if let Err(e) = server.run() {
        error!("server stopped: {e}");
        return Err(e.into());
    }
    Ok(())
}
