pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod api;
pub mod child;
pub mod cli;
pub mod cond;
pub mod conf;
pub mod conf_watch;
pub mod dev_watch;
pub mod environment;
pub mod inetd;
pub mod log_sink;
pub mod pidfile;
pub mod reconcile;
pub mod registry;
pub mod runlevel;
pub mod signals;
pub mod state;
pub mod supervisor;
pub mod svc;
pub mod timer;

pub use cli::{Cli, Config};
pub use environment::Environment;
pub use supervisor::Supervisor;
