use std::path::Path;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::child::read_pidfile;
use crate::cond::CondStore;
use crate::registry::Registry;
use crate::svc::{SvcKey, SvcState};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidfileEvent {
    /// Created, modified, touched or moved into place.
    Touched(String),
    Removed(String),
}

/// Watches the run directory for pidfiles. Forking daemons confirm
/// startup by writing their own pidfile; the watcher adopts the PID from
/// it and asserts the record's conditions.
pub struct PidfileWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<PidfileEvent>,
}

impl PidfileWatcher {
    pub fn new(run_dir: &Path) -> Result<PidfileWatcher> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        error!("pidfile watch error: {}", e);
                        return;
                    }
                };

                for path in &event.paths {
                    let name = match path.file_name() {
                        Some(name) => name.to_string_lossy().into_owned(),
                        None => continue,
                    };
                    if !name.ends_with(".pid") {
                        continue;
                    }

                    let ev = if event.kind.is_remove() {
                        PidfileEvent::Removed(name)
                    } else {
                        PidfileEvent::Touched(name)
                    };

                    if tx.send(ev).is_err() {
                        return;
                    }
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(run_dir, RecursiveMode::NonRecursive)?;
        debug!("pidfile monitor active on {}", run_dir.display());

        Ok(PidfileWatcher {
            _watcher: watcher,
            rx,
        })
    }

    pub async fn next(&mut self) -> Option<PidfileEvent> {
        self.rx.recv().await
    }
}

/// React to a pidfile event: confirm the matching record as started
/// (adopting the PID for forking daemons) or drop its `pid/` fact on
/// removal. Returns the record key plus the fact paths that changed so
/// the caller can re-step subscribers.
pub fn apply_event(
    event: &PidfileEvent,
    registry: &mut Registry,
    conds: &mut CondStore,
    run_dir: &Path,
) -> (Option<SvcKey>, Vec<String>) {
    let mut changed = Vec::new();

    let basename = match event {
        PidfileEvent::Touched(name) | PidfileEvent::Removed(name) => name.as_str(),
    };

    let key = match registry.find_by_pidfile_basename(run_dir, basename) {
        Some(key) => key,
        None => return (None, changed),
    };
    let svc = match registry.get_mut(&key) {
        Some(svc) => svc,
        None => return (None, changed),
    };

    match event {
        PidfileEvent::Touched(_) => {
            if svc.state != SvcState::Running {
                return (Some(key), changed);
            }

            if svc.is_forking() {
                if let Some(pid) = read_pidfile(&svc.pidfile_path(run_dir)) {
                    if svc.pid != Some(pid) {
                        debug!("{}: adopting pid {} from pidfile", svc.ident(), pid);
                        svc.pid = Some(pid);
                    }
                }
            }
            svc.flags.starting = false;

            if conds.set(&svc.cond_name()) {
                changed.push(svc.cond_name());
            }
            if conds.set(&svc.pid_cond_name()) {
                changed.push(svc.pid_cond_name());
            }
        }
        PidfileEvent::Removed(_) => {
            if conds.clear(&svc.pid_cond_name()) {
                changed.push(svc.pid_cond_name());
            }
        }
    }

    (Some(key), changed)
}
