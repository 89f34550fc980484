type Result<T> = color_eyre::eyre::Result<T>;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

use rinit::cli::{Cli, Config};
use rinit::supervisor::{LogHandle, Supervisor};

fn main() -> Result<()> {
    // Initialize error handling and logging BEFORE the tokio runtime.
    color_eyre::install()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, log_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    info!("rinit starting");

    // Single-threaded cooperative scheduling: every mutation of the
    // registry, condition store and governor happens on this one thread.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    match rt.block_on(local.run_until(async_main(config, log_handle))) {
        Ok(()) => Ok(()),
        Err(e) => fatal(e),
    }
}

/// As process 1 a fatal error must not return to the kernel: drop into a
/// rescue shell if one is available, otherwise idle forever.
fn fatal(e: color_eyre::eyre::Report) -> Result<()> {
    if nix::unistd::getpid().as_raw() != 1 {
        return Err(e);
    }

    error!("fatal: {:#}", e);
    for shell in ["/bin/sh", "/bin/ash", "/bin/bash"] {
        if std::process::Command::new(shell).status().is_ok() {
            break;
        }
    }

    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}

async fn async_main(config: Config, log_handle: LogHandle) -> Result<()> {
    let mut supervisor = Supervisor::new(config, Some(log_handle))?;
    supervisor.run().await?;

    info!("rinit exiting");
    Ok(())
}
