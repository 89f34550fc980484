use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::svc::SvcKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondState {
    Off,
    /// Known-stale during a reload: was ON, waiting for reassertion.
    Flux,
    On,
}

/// In-memory set of named boolean facts, mirrored as zero-byte files under
/// the run directory so external observers can watch them with inotify.
///
/// The in-memory map is authoritative; a failed file operation is logged
/// and otherwise ignored. ON facts live under `cond/<path>`, FLUX facts
/// under the sibling `flux/<path>`, OFF facts have no file.
pub struct CondStore {
    cond_dir: PathBuf,
    flux_dir: PathBuf,
    facts: HashMap<String, CondState>,
    /// Reverse index: fact path -> records whose start condition uses it.
    subscribers: HashMap<String, Vec<SvcKey>>,
}

impl CondStore {
    pub fn new(run_dir: &Path) -> crate::Result<CondStore> {
        let cond_dir = run_dir.join("cond");
        let flux_dir = run_dir.join("flux");
        fs::create_dir_all(&cond_dir)?;
        fs::create_dir_all(&flux_dir)?;

        Ok(CondStore {
            cond_dir,
            flux_dir,
            facts: HashMap::new(),
            subscribers: HashMap::new(),
        })
    }

    pub fn get(&self, path: &str) -> CondState {
        self.facts.get(path).copied().unwrap_or(CondState::Off)
    }

    /// Assert a fact. Returns true if the observable state changed.
    pub fn set(&mut self, path: &str) -> bool {
        let prev = self.facts.insert(path.to_string(), CondState::On);
        if prev == Some(CondState::On) {
            return false;
        }

        debug!("condition {} -> on", path);
        self.write_file(&self.cond_dir.join(path));
        self.remove_file(&self.flux_dir.join(path));
        true
    }

    /// Clear a fact. Returns true if the observable state changed.
    pub fn clear(&mut self, path: &str) -> bool {
        let prev = self.facts.remove(path);
        if prev.is_none() || prev == Some(CondState::Off) {
            return false;
        }

        debug!("condition {} -> off", path);
        self.remove_file(&self.cond_dir.join(path));
        self.remove_file(&self.flux_dir.join(path));
        true
    }

    /// Reassert a fact after a reload; same edge semantics as `set` but
    /// logged distinctly since the writer is confirming existing health.
    pub fn reassert(&mut self, path: &str) -> bool {
        if self.get(path) == CondState::Flux {
            debug!("condition {} reasserted", path);
        }
        self.set(path)
    }

    /// Demote every ON fact under the prefix to FLUX. Used at the start of
    /// a reload so that only affirmative re-assertion brings a fact back.
    pub fn mark_flux(&mut self, prefix: &str) {
        for (path, state) in self.facts.iter_mut() {
            if *state == CondState::On && path.starts_with(prefix) {
                *state = CondState::Flux;
                debug!("condition {} -> flux", path);
                let from = self.cond_dir.join(path);
                let to = self.flux_dir.join(path);
                if let Some(parent) = to.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = fs::rename(&from, &to) {
                    warn!("cannot move condition file {}: {}", from.display(), e);
                }
            }
        }
    }

    /// Resolve every fact still in FLUX to OFF. Returns the affected
    /// paths so their subscribers can be re-stepped.
    pub fn resolve_flux(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .facts
            .iter()
            .filter(|(_, s)| **s == CondState::Flux)
            .map(|(p, _)| p.clone())
            .collect();

        for path in &stale {
            self.clear(path);
        }

        stale
    }

    /// All facts in the store, for enumeration by the API.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &CondState)> {
        self.facts.iter()
    }

    /// Rebuild the reverse index from the registered records' conditions.
    pub fn rebuild_index<'a>(&mut self, records: impl Iterator<Item = (SvcKey, &'a [String])>) {
        self.subscribers.clear();
        for (key, conds) in records {
            for cond in conds {
                self.subscribers
                    .entry(cond.clone())
                    .or_default()
                    .push(key.clone());
            }
        }
    }

    pub fn subscribers(&self, path: &str) -> &[SvcKey] {
        self.subscribers.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_subscriber(&self, path: &str) -> bool {
        !self.subscribers(path).is_empty()
    }

    /// All of the record's conditions are ON. An empty conjunction is
    /// trivially satisfied.
    pub fn all_on(&self, conds: &[String]) -> bool {
        conds.iter().all(|c| self.get(c) == CondState::On)
    }

    /// At least one of the record's conditions is OFF (FLUX does not count).
    pub fn any_off(&self, conds: &[String]) -> bool {
        conds.iter().any(|c| self.get(c) == CondState::Off)
    }

    fn write_file(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("cannot create condition dir {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = fs::write(path, b"") {
            warn!("cannot write condition file {}: {}", path.display(), e);
        }
    }

    fn remove_file(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot remove condition file {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, CondStore) {
        let dir = tempdir().unwrap();
        let store = CondStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_set_get_clear() {
        let (_dir, mut store) = store();
        assert_eq!(store.get("net/eth0/up"), CondState::Off);

        assert!(store.set("net/eth0/up"));
        assert_eq!(store.get("net/eth0/up"), CondState::On);
        // Setting twice is not an edge.
        assert!(!store.set("net/eth0/up"));

        assert!(store.clear("net/eth0/up"));
        assert_eq!(store.get("net/eth0/up"), CondState::Off);
        assert!(!store.clear("net/eth0/up"));
    }

    #[test]
    fn test_set_then_clear_restores_prestate() {
        let (dir, mut store) = store();
        store.set("usr/x");
        store.clear("usr/x");
        assert_eq!(store.get("usr/x"), CondState::Off);
        assert!(!dir.path().join("cond/usr/x").exists());
    }

    #[test]
    fn test_disk_mirror() {
        let (dir, mut store) = store();
        store.set("svc//sbin/ntpd");
        assert!(dir.path().join("cond/svc//sbin/ntpd").exists());

        store.mark_flux("svc/");
        assert!(!dir.path().join("cond/svc//sbin/ntpd").exists());
        assert!(dir.path().join("flux/svc//sbin/ntpd").exists());
        assert_eq!(store.get("svc//sbin/ntpd"), CondState::Flux);

        store.set("svc//sbin/ntpd");
        assert!(dir.path().join("cond/svc//sbin/ntpd").exists());
        assert!(!dir.path().join("flux/svc//sbin/ntpd").exists());
    }

    #[test]
    fn test_mark_flux_honors_prefix() {
        let (_dir, mut store) = store();
        store.set("svc//bin/a");
        store.set("usr/custom");

        store.mark_flux("svc/");
        assert_eq!(store.get("svc//bin/a"), CondState::Flux);
        assert_eq!(store.get("usr/custom"), CondState::On);
    }

    #[test]
    fn test_resolve_flux_drops_stale() {
        let (_dir, mut store) = store();
        store.set("svc//bin/a");
        store.set("svc//bin/b");
        store.mark_flux("svc/");
        store.reassert("svc//bin/a");

        let stale = store.resolve_flux();
        assert_eq!(stale, vec!["svc//bin/b".to_string()]);
        assert_eq!(store.get("svc//bin/a"), CondState::On);
        assert_eq!(store.get("svc//bin/b"), CondState::Off);
    }

    #[test]
    fn test_conjunction_semantics() {
        let (_dir, mut store) = store();
        let conds = vec!["a".to_string(), "b".to_string()];

        // Empty conjunction is always satisfied.
        assert!(store.all_on(&[]));

        store.set("a");
        assert!(!store.all_on(&conds));
        assert!(store.any_off(&conds));

        store.set("b");
        assert!(store.all_on(&conds));

        store.mark_flux("");
        // FLUX is neither ON nor OFF.
        assert!(!store.all_on(&conds));
        assert!(!store.any_off(&conds));
    }

    #[test]
    fn test_subscriber_index() {
        let (_dir, mut store) = store();
        let a = (1u32, String::new());
        let b = (2u32, String::new());
        let a_conds = vec!["net/eth0/up".to_string()];
        let b_conds = vec!["net/eth0/up".to_string(), "usr/ready".to_string()];

        store.rebuild_index(
            [
                (a.clone(), a_conds.as_slice()),
                (b.clone(), b_conds.as_slice()),
            ]
            .into_iter(),
        );

        assert_eq!(store.subscribers("net/eth0/up"), &[a, b.clone()]);
        assert_eq!(store.subscribers("usr/ready"), &[b]);
        assert!(store.subscribers("unknown").is_empty());
    }
}
