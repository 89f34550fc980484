use std::path::Path;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevEvent {
    Added(String),
    Removed(String),
}

/// Watches /dev for hotplugged terminal devices. Node appearance and
/// disappearance is translated into `dev/<node>` facts, which gate the
/// tty records referencing the device.
pub struct DevWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<DevEvent>,
}

impl DevWatcher {
    pub fn new(dev_dir: &Path) -> Result<DevWatcher> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        error!("device watch error: {}", e);
                        return;
                    }
                };

                for path in &event.paths {
                    let name = match path.file_name() {
                        Some(name) => name.to_string_lossy().into_owned(),
                        None => continue,
                    };

                    let ev = if event.kind.is_remove() {
                        DevEvent::Removed(name)
                    } else if event.kind.is_create() {
                        DevEvent::Added(name)
                    } else {
                        continue;
                    };

                    if tx.send(ev).is_err() {
                        return;
                    }
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(dev_dir, RecursiveMode::NonRecursive)?;
        debug!("watching {} for hotplug devices", dev_dir.display());

        Ok(DevWatcher {
            _watcher: watcher,
            rx,
        })
    }

    pub async fn next(&mut self) -> Option<DevEvent> {
        self.rx.recv().await
    }
}
