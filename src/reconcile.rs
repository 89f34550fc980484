use std::path::Path;

use tracing::{debug, info};

use crate::cond::CondStore;
use crate::registry::Registry;
use crate::svc::{Svc, SvcState};

/// Sweep pass of a reload: reconcile parsed candidates against the
/// registry. Every record must have been tagged by `Registry::mark_dynamic`
/// first; candidates clear the tag on match, and whatever stays tagged is
/// scheduled for removal.
///
/// Matched records whose attributes differ byte-for-byte get the changed
/// flag; new candidates are inserted halted. Candidates are deduplicated
/// first with latter-wins semantics, so a drop-dir snippet overrides an
/// entry of the same service in the main file.
pub fn sweep(registry: &mut Registry, candidates: Vec<Svc>) {
    for cand in dedupe(candidates) {
        match registry.match_candidate(&cand) {
            Some(key) => {
                let svc = match registry.get_mut(&key) {
                    Some(svc) => svc,
                    None => continue,
                };
                svc.flags.dynamic_mark = false;

                if svc.config_eq(&cand) {
                    // Only the bookkeeping may move (file renames).
                    svc.origin = cand.origin;
                } else {
                    debug!("{} changed by reload", svc.ident());
                    svc.absorb(&cand);
                    svc.flags.changed = true;
                    if svc.ty.is_oneshot() {
                        svc.flags.completed = false;
                    }
                }
            }
            None => {
                info!("registering {}", cand.ident());
                registry.insert(cand);
            }
        }
    }

    for svc in registry.iter_mut() {
        if svc.flags.dynamic_mark {
            svc.flags.dynamic_mark = false;
            if !svc.flags.protected {
                info!("{} no longer configured, scheduling removal", svc.ident());
                svc.flags.removal = true;
            }
        }

        // A reload gives blocked records a fresh start.
        if svc.state == SvcState::Blocked {
            svc.reset_restart_history();
            svc.state = SvcState::Halted;
        }
    }
}

/// Latter-wins deduplication over one parse's candidates, matching the
/// way a later file overrides an earlier definition of the same service.
fn dedupe(candidates: Vec<Svc>) -> Vec<Svc> {
    let mut out: Vec<Svc> = Vec::with_capacity(candidates.len());
    for cand in candidates {
        match out
            .iter_mut()
            .find(|c| c.name == cand.name && c.instance == cand.instance)
        {
            Some(existing) => *existing = cand,
            None => out.push(cand),
        }
    }
    out
}

/// Condition resolution between sweep and converge: unchanged running
/// records re-assert their `svc/` fact (and `pid/` when their pidfile is
/// on disk), then every fact still in FLUX drops to OFF. Returns the
/// dropped fact paths so their subscribers can be re-stepped.
pub fn resolve_conditions(
    registry: &Registry,
    conds: &mut CondStore,
    run_dir: &Path,
) -> Vec<String> {
    for svc in registry.iter() {
        if svc.state != SvcState::Running {
            continue;
        }
        if svc.flags.changed || svc.flags.starting {
            continue;
        }

        conds.reassert(&svc.cond_name());
        if svc.pidfile_path(run_dir).exists() {
            conds.reassert(&svc.pid_cond_name());
        }
    }

    conds.resolve_flux()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::{RunlevelMask, SvcType};
    use std::path::PathBuf;

    fn candidate(cmd: &str, levels: &str) -> Svc {
        let mut svc = Svc::new(SvcType::Service, PathBuf::from(cmd));
        svc.runlevels = RunlevelMask::parse(Some(levels));
        svc.origin = Some(PathBuf::from("/etc/test.conf"));
        svc
    }

    fn reconcile(registry: &mut Registry, candidates: Vec<Svc>) {
        registry.mark_dynamic();
        sweep(registry, candidates);
    }

    #[test]
    fn test_sweep_inserts_new_records() {
        let mut reg = Registry::new();
        reconcile(&mut reg, vec![candidate("/bin/a", "[2]")]);
        assert_eq!(reg.len(), 1);
        let svc = reg.iter().next().unwrap();
        assert_eq!(svc.state, SvcState::Halted);
        assert!(!svc.flags.removal);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let mut reg = Registry::new();
        reconcile(&mut reg, vec![candidate("/bin/a", "[2]")]);

        let job = reg.iter().next().unwrap().job;
        reconcile(&mut reg, vec![candidate("/bin/a", "[2]")]);

        assert_eq!(reg.len(), 1);
        let svc = reg.iter().next().unwrap();
        assert_eq!(svc.job, job);
        assert!(!svc.flags.changed);
        assert!(!svc.flags.removal);
        assert!(!svc.flags.dynamic_mark);
    }

    #[test]
    fn test_sweep_flags_changed_attributes() {
        let mut reg = Registry::new();
        reconcile(&mut reg, vec![candidate("/bin/a", "[2]")]);

        let mut edited = candidate("/bin/a", "[23]");
        edited.args = vec!["-v".to_string()];
        reconcile(&mut reg, vec![edited]);

        let svc = reg.iter().next().unwrap();
        assert!(svc.flags.changed);
        assert!(svc.runlevels.contains(3));
        assert_eq!(svc.args, vec!["-v".to_string()]);
    }

    #[test]
    fn test_sweep_schedules_removal() {
        let mut reg = Registry::new();
        reconcile(
            &mut reg,
            vec![candidate("/bin/a", "[2]"), candidate("/bin/b", "[2]")],
        );
        assert_eq!(reg.len(), 2);

        reconcile(&mut reg, vec![candidate("/bin/a", "[2]")]);
        let b = reg
            .iter()
            .find(|s| s.cmd == PathBuf::from("/bin/b"))
            .unwrap();
        assert!(b.flags.removal);
        let a = reg
            .iter()
            .find(|s| s.cmd == PathBuf::from("/bin/a"))
            .unwrap();
        assert!(!a.flags.removal);
    }

    #[test]
    fn test_protected_records_survive() {
        let mut reg = Registry::new();
        let mut wdog = candidate("/sbin/watchdogd", "[2345]");
        wdog.flags.protected = true;
        reg.insert(wdog);

        reconcile(&mut reg, Vec::new());
        assert!(!reg.iter().next().unwrap().flags.removal);
    }

    #[test]
    fn test_snippet_overrides_main_entry() {
        let mut reg = Registry::new();
        let main = candidate("/bin/a", "[2]");
        let mut snippet = candidate("/bin/a", "[234]");
        snippet.args = vec!["--snippet".to_string()];

        reconcile(&mut reg, vec![main, snippet]);
        assert_eq!(reg.len(), 1);
        let svc = reg.iter().next().unwrap();
        assert_eq!(svc.args, vec!["--snippet".to_string()]);
        assert!(svc.runlevels.contains(4));
    }

    #[test]
    fn test_reload_unblocks() {
        let mut reg = Registry::new();
        reconcile(&mut reg, vec![candidate("/bin/a", "[2]")]);
        {
            let svc = reg.iter_mut().next().unwrap();
            svc.state = SvcState::Blocked;
            svc.blocked_reason = "too many restarts".to_string();
        }

        reconcile(&mut reg, vec![candidate("/bin/a", "[2]")]);
        let svc = reg.iter().next().unwrap();
        assert_eq!(svc.state, SvcState::Halted);
        assert!(svc.blocked_reason.is_empty());
    }

    #[test]
    fn test_resolve_conditions_reasserts_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut conds = CondStore::new(dir.path()).unwrap();
        let mut reg = Registry::new();

        let mut up = candidate("/bin/up", "[2]");
        up.state = SvcState::Running;
        let mut changed = candidate("/bin/changed", "[2]");
        changed.state = SvcState::Running;
        changed.flags.changed = true;
        reg.insert(up);
        reg.insert(changed);

        conds.set("svc//bin/up");
        conds.set("svc//bin/changed");
        conds.mark_flux("svc/");

        let stale = resolve_conditions(&reg, &mut conds, dir.path());
        assert_eq!(conds.get("svc//bin/up"), crate::cond::CondState::On);
        assert_eq!(conds.get("svc//bin/changed"), crate::cond::CondState::Off);
        assert_eq!(stale, vec!["svc//bin/changed".to_string()]);
    }
}
