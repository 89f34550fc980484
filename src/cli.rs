use clap::Parser;
use eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;

use crate::Result;

/// A SysV/BSD-style process-1 init and service supervisor
#[derive(Parser)]
#[command(name = "rinit")]
#[command(about = "A SysV/BSD-style process-1 init and service supervisor")]
#[command(version)]
pub struct Cli {
    /// Main configuration file
    #[arg(long, default_value = "/etc/rinit.conf")]
    pub config: PathBuf,

    /// Directory of per-service configuration snippets
    #[arg(long, default_value = "/etc/rinit.d")]
    pub config_dir: PathBuf,

    /// Runtime state directory (conditions, pidfiles, API socket)
    #[arg(long, default_value = "/run/rinit")]
    pub run_dir: PathBuf,

    /// Control API socket (default: <run-dir>/socket)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Grace period for a runlevel transition's stop phase (seconds)
    #[arg(long, default_value = "10")]
    pub stop_grace_secs: u64,

    /// Delay between the stop signal and SIGKILL (seconds)
    #[arg(long, default_value = "5")]
    pub kill_delay_secs: u64,

    /// Safety-net zombie reaping interval (ms)
    #[arg(long, default_value = "5000")]
    pub reap_interval_ms: u64,

    /// Override the configured runlevel to enter after bootstrap
    #[arg(long)]
    pub runlevel: Option<u8>,

    /// Boot into single-user mode (runlevel 1)
    #[arg(long)]
    pub single: bool,

    /// Boot into rescue mode: a root shell instead of normal services
    #[arg(long)]
    pub rescue: bool,

    /// Getty to exec for built-in tty lines
    #[arg(long, default_value = "/sbin/getty")]
    pub getty: PathBuf,

    /// Device directory watched for hotplug terminals
    #[arg(long, default_value = "/dev")]
    pub dev_dir: PathBuf,
}

/// Resolved runtime configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct Config {
    pub conf_file: PathBuf,
    pub conf_dir: PathBuf,
    pub run_dir: PathBuf,
    pub socket: PathBuf,
    pub stop_grace: Duration,
    pub kill_delay: Duration,
    pub reap_interval: Duration,
    pub runlevel_override: Option<u8>,
    pub single: bool,
    pub rescue: bool,
    pub getty: PathBuf,
    pub dev_dir: PathBuf,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if let Some(level) = cli.runlevel {
            if !(1..=9).contains(&level) || level == 6 {
                return Err(eyre!(
                    "invalid runlevel {}, valid levels are [1-9] excluding 6",
                    level
                ));
            }
        }

        let socket = cli
            .socket
            .unwrap_or_else(|| cli.run_dir.join("socket"));

        Ok(Config {
            conf_file: cli.config,
            conf_dir: cli.config_dir,
            run_dir: cli.run_dir,
            socket,
            stop_grace: Duration::from_secs(cli.stop_grace_secs),
            kill_delay: Duration::from_secs(cli.kill_delay_secs),
            reap_interval: Duration::from_millis(cli.reap_interval_ms),
            runlevel_override: cli.runlevel,
            single: cli.single,
            rescue: cli.rescue,
            getty: cli.getty,
            dev_dir: cli.dev_dir,
        })
    }
}
