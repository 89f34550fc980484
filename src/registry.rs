use std::collections::BTreeMap;
use std::path::Path;

use nix::unistd::Pid;

use crate::svc::{Svc, SvcKey, SvcState};

/// Owns every service record, keyed by (job id, instance id).
///
/// BTreeMap ordering doubles as declaration order, since job ids are
/// assigned monotonically at registration; `run` serialization and the
/// API iterator rely on this. Lookups by pid, name or pidfile are scans,
/// the record count is small.
#[derive(Default)]
pub struct Registry {
    svcs: BTreeMap<SvcKey, Svc>,
    next_job: u32,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            svcs: BTreeMap::new(),
            next_job: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.svcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.svcs.is_empty()
    }

    /// Insert a parsed candidate as a new record, assigning its job id.
    pub fn insert(&mut self, mut cand: Svc) -> SvcKey {
        cand.job = self.next_job;
        self.next_job += 1;

        let key = cand.key();
        self.svcs.insert(key.clone(), cand);
        key
    }

    pub fn remove(&mut self, key: &SvcKey) -> Option<Svc> {
        self.svcs.remove(key)
    }

    pub fn get(&self, key: &SvcKey) -> Option<&Svc> {
        self.svcs.get(key)
    }

    pub fn get_mut(&mut self, key: &SvcKey) -> Option<&mut Svc> {
        self.svcs.get_mut(key)
    }

    pub fn keys(&self) -> Vec<SvcKey> {
        self.svcs.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Svc> {
        self.svcs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Svc> {
        self.svcs.values_mut()
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<SvcKey> {
        self.svcs
            .values()
            .find(|s| s.pid == Some(pid))
            .map(Svc::key)
    }

    pub fn find_by_name(&self, name: &str, instance: &str) -> Option<SvcKey> {
        self.svcs
            .values()
            .find(|s| s.name == name && s.instance == instance)
            .map(Svc::key)
    }

    pub fn find_by_job(&self, job: u32, instance: &str) -> Option<SvcKey> {
        self.svcs
            .values()
            .find(|s| s.job == job && s.instance == instance)
            .map(Svc::key)
    }

    /// All records with the given name, any instance.
    pub fn find_all_by_name(&self, name: &str) -> Vec<SvcKey> {
        self.svcs
            .values()
            .filter(|s| s.name == name)
            .map(Svc::key)
            .collect()
    }

    pub fn find_all_by_job(&self, job: u32) -> Vec<SvcKey> {
        self.svcs
            .values()
            .filter(|s| s.job == job)
            .map(Svc::key)
            .collect()
    }

    /// Match a pidfile event to the record expecting that basename.
    pub fn find_by_pidfile_basename(&self, run_dir: &Path, basename: &str) -> Option<SvcKey> {
        self.svcs
            .values()
            .find(|s| {
                s.pidfile_path(run_dir)
                    .file_name()
                    .map(|n| n.to_string_lossy() == basename)
                    .unwrap_or(false)
            })
            .map(Svc::key)
    }

    /// Match a candidate from a sweep against an existing record, by
    /// (name, instance) first and (command, instance) as fallback. Only
    /// records still carrying the sweep mark can match, so each record is
    /// claimed by at most one candidate per reconciliation.
    pub fn match_candidate(&self, cand: &Svc) -> Option<SvcKey> {
        self.svcs
            .values()
            .find(|s| {
                s.flags.dynamic_mark && s.name == cand.name && s.instance == cand.instance
            })
            .or_else(|| {
                self.svcs.values().find(|s| {
                    s.flags.dynamic_mark && s.cmd == cand.cmd && s.instance == cand.instance
                })
            })
            .map(Svc::key)
    }

    /// Mark pass of the reconciler: tag every record and clear stale
    /// change flags. Protected records are swept over but never removed.
    pub fn mark_dynamic(&mut self) {
        for svc in self.svcs.values_mut() {
            svc.flags.changed = false;
            svc.flags.dynamic_mark = true;
        }
    }

    /// Flag every record originating from the given file as changed.
    pub fn mark_dirty_by_origin(&mut self, origin: &Path) {
        for svc in self.svcs.values_mut() {
            if svc.origin.as_deref() == Some(origin) {
                svc.flags.changed = true;
            }
        }
    }

    /// True while any record still has a live or terminating process.
    pub fn any_active(&self) -> bool {
        self.svcs
            .values()
            .any(|s| matches!(s.state, SvcState::Running | SvcState::Stopping) && s.pid.is_some())
    }

    pub fn any_stopping(&self) -> bool {
        self.svcs.values().any(|s| s.state == SvcState::Stopping)
    }

    /// No earlier-declared `run` record at this level is still active;
    /// gates the serial execution of `run` stanzas.
    pub fn run_gate_clear(&self, job: u32, level: u8) -> bool {
        !self.svcs.values().any(|s| {
            s.ty == crate::svc::SvcType::Run
                && s.job < job
                && s.runlevels.contains(level)
                && matches!(
                    s.state,
                    SvcState::Waiting | SvcState::Ready | SvcState::Running | SvcState::Stopping
                )
        })
    }

    /// An outstanding `run` record at this level; the governor will not
    /// advance past the level's run sequence until they all terminate.
    pub fn runs_pending(&self, level: u8) -> bool {
        self.svcs.values().any(|s| {
            s.ty == crate::svc::SvcType::Run
                && s.runlevels.contains(level)
                && matches!(
                    s.state,
                    SvcState::Waiting | SvcState::Ready | SvcState::Running
                )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::SvcType;
    use std::path::PathBuf;

    fn record(cmd: &str) -> Svc {
        Svc::new(SvcType::Service, PathBuf::from(cmd))
    }

    #[test]
    fn test_insert_assigns_monotonic_jobs() {
        let mut reg = Registry::new();
        let a = reg.insert(record("/bin/a"));
        let b = reg.insert(record("/bin/b"));
        assert_eq!(a.0, 1);
        assert_eq!(b.0, 2);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_find_by_pid() {
        let mut reg = Registry::new();
        let key = reg.insert(record("/bin/a"));
        reg.get_mut(&key).unwrap().pid = Some(Pid::from_raw(1234));

        assert_eq!(reg.find_by_pid(Pid::from_raw(1234)), Some(key));
        assert_eq!(reg.find_by_pid(Pid::from_raw(4321)), None);
    }

    #[test]
    fn test_find_by_name_and_instance() {
        let mut reg = Registry::new();
        let mut svc = record("/sbin/getty");
        svc.instance = "tty1".to_string();
        let key = reg.insert(svc);

        assert_eq!(reg.find_by_name("getty", "tty1"), Some(key));
        assert_eq!(reg.find_by_name("getty", "tty2"), None);
    }

    #[test]
    fn test_match_candidate_by_name_then_cmd() {
        let mut reg = Registry::new();
        let key = reg.insert(record("/bin/a"));
        reg.mark_dynamic();

        let cand = record("/bin/a");
        assert_eq!(reg.match_candidate(&cand), Some(key.clone()));

        // Same name, different path still matches by name.
        let moved = record("/usr/bin/a");
        assert_eq!(reg.match_candidate(&moved), Some(key.clone()));

        let other = record("/bin/b");
        assert_eq!(reg.match_candidate(&other), None);

        // A claimed record cannot match a second candidate.
        reg.get_mut(&key).unwrap().flags.dynamic_mark = false;
        assert_eq!(reg.match_candidate(&cand), None);
    }

    #[test]
    fn test_same_cmd_distinct_names_stay_separate() {
        let mut reg = Registry::new();
        let mut a = record("/bin/sleep");
        a.name = "a".to_string();
        let mut b = record("/bin/sleep");
        b.name = "b".to_string();
        let ka = reg.insert(a);
        reg.insert(b);
        reg.mark_dynamic();

        let mut cand = record("/bin/sleep");
        cand.name = "a".to_string();
        assert_eq!(reg.match_candidate(&cand), Some(ka));
    }

    #[test]
    fn test_run_gate_serializes_by_declaration() {
        let mut reg = Registry::new();
        let mut first = Svc::new(SvcType::Run, PathBuf::from("/bin/first"));
        first.runlevels = crate::svc::RunlevelMask::parse(Some("[2]"));
        let mut second = Svc::new(SvcType::Run, PathBuf::from("/bin/second"));
        second.runlevels = crate::svc::RunlevelMask::parse(Some("[2]"));

        let k1 = reg.insert(first);
        let k2 = reg.insert(second);

        reg.get_mut(&k1).unwrap().state = SvcState::Running;
        let second_job = reg.get(&k2).unwrap().job;
        assert!(!reg.run_gate_clear(second_job, 2));

        reg.get_mut(&k1).unwrap().state = SvcState::Halted;
        assert!(reg.run_gate_clear(second_job, 2));

        // A run at another level does not gate.
        assert!(reg.run_gate_clear(second_job, 3));
    }

    #[test]
    fn test_mark_dirty_by_origin() {
        let mut reg = Registry::new();
        let mut a = record("/bin/a");
        a.origin = Some(PathBuf::from("/etc/test.d/a.conf"));
        let mut b = record("/bin/b");
        b.origin = Some(PathBuf::from("/etc/test.d/b.conf"));
        let ka = reg.insert(a);
        let kb = reg.insert(b);

        reg.mark_dirty_by_origin(Path::new("/etc/test.d/a.conf"));
        assert!(reg.get(&ka).unwrap().flags.changed);
        assert!(!reg.get(&kb).unwrap().flags.changed);
    }

    #[test]
    fn test_pidfile_basename_lookup() {
        let mut reg = Registry::new();
        let key = reg.insert(record("/sbin/ntpd"));
        let run = Path::new("/run/rinit");

        assert_eq!(reg.find_by_pidfile_basename(run, "ntpd.pid"), Some(key));
        assert_eq!(reg.find_by_pidfile_basename(run, "other.pid"), None);
    }
}
