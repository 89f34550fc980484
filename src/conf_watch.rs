use std::fs;
use std::path::{Path, PathBuf};

use eyre::WrapErr;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::Result;

/// Watches the main configuration file and the drop-in directory,
/// recording which files changed. The supervisor only acts on the record
/// at the next reload request; changes are dropped once consumed.
pub struct ConfWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl ConfWatcher {
    /// Failing to watch the configuration directory is fatal at boot.
    pub fn new(conf_file: &Path, conf_dir: &Path) -> Result<ConfWatcher> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for path in event.paths {
                        if let Err(e) = tx.send(path) {
                            error!("cannot queue config change event: {}", e);
                        }
                    }
                }
                Err(e) => error!("config watch error: {}", e),
            },
            notify::Config::default(),
        )?;

        fs::create_dir_all(conf_dir)
            .wrap_err_with(|| format!("cannot create {}", conf_dir.display()))?;
        watcher
            .watch(conf_dir, RecursiveMode::Recursive)
            .wrap_err_with(|| format!("cannot watch {}", conf_dir.display()))?;

        // The main file is optional; a system may only use the drop dir.
        if conf_file.exists() {
            if let Err(e) = watcher.watch(conf_file, RecursiveMode::NonRecursive) {
                debug!("not watching {}: {}", conf_file.display(), e);
            }
        }

        debug!(
            "watching {} and {} for changes",
            conf_file.display(),
            conf_dir.display()
        );
        Ok(ConfWatcher {
            _watcher: watcher,
            rx,
        })
    }

    pub async fn next(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }
}
