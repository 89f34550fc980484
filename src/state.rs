use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::child::{ChildSupervisor, ExitKind};
use crate::cond::CondStore;
use crate::environment::Environment;
use crate::inetd::InetdEngine;
use crate::registry::Registry;
use crate::svc::{Svc, SvcKey, SvcState, SvcType};
use crate::timer::{TimerKey, TimerQueue};

/// Everything a state-machine step may touch besides the record itself.
/// The supervisor splits itself into this view so one record can be
/// borrowed from the registry while the rest stays reachable.
pub struct StepCtx<'a> {
    pub conds: &'a mut CondStore,
    pub children: &'a mut ChildSupervisor,
    pub timers: &'a mut TimerQueue,
    pub inetd: &'a mut InetdEngine,
    pub env: &'a Environment,
    /// Current runlevel.
    pub level: u8,
    /// False during a runlevel transition's stop phase: nothing new
    /// starts until the ineligible records have halted.
    pub start_allowed: bool,
    pub kill_delay: Duration,
}

/// Whether the record should be alive at the given level: in the mask,
/// not deleted, not held by an operator stop, and (for manual records)
/// explicitly started.
pub fn eligible(svc: &Svc, level: u8) -> bool {
    !svc.flags.removal
        && !svc.flags.stopped
        && svc.runlevels.contains(level)
        && (!svc.flags.manual || svc.flags.forced)
        && svc.state != SvcState::Blocked
}

/// Step one record toward its target state. Chains through intermediate
/// states (WAITING → READY → RUNNING happens in one call when nothing
/// blocks) and reports whether anything changed.
pub fn step_record(registry: &mut Registry, key: &SvcKey, ctx: &mut StepCtx) -> bool {
    let mut any = false;

    // A record can traverse at most a handful of edges per trigger.
    for _ in 0..8 {
        let run_gate = match registry.get(key) {
            Some(svc) if svc.ty == SvcType::Run => registry.run_gate_clear(svc.job, ctx.level),
            Some(_) => true,
            None => return any,
        };

        let svc = match registry.get_mut(key) {
            Some(svc) => svc,
            None => return any,
        };

        if !step_once(svc, run_gate, ctx) {
            break;
        }
        any = true;
    }

    any
}

/// Re-step every record until a fixed point is reached. The pass bound is
/// the record count plus slack for condition chains.
pub fn converge(registry: &mut Registry, ctx: &mut StepCtx) {
    let max_passes = registry.len() + 32;
    for _ in 0..max_passes {
        let mut changed = false;
        for key in registry.keys() {
            changed |= step_record(registry, &key, ctx);
        }
        if !changed {
            return;
        }
    }
    warn!("service convergence did not settle, giving up this pass");
}

fn step_once(svc: &mut Svc, run_gate_clear: bool, ctx: &mut StepCtx) -> bool {
    let from = svc.state;

    match svc.state {
        SvcState::Halted => {
            if svc.flags.removal {
                svc.state = SvcState::Dead;
            } else if !eligible(svc, ctx.level) {
                svc.flags.completed = false;
            } else if ctx.start_allowed && !svc.flags.completed {
                svc.state = SvcState::Waiting;
            }
        }

        SvcState::Waiting => {
            if !eligible(svc, ctx.level) {
                svc.state = SvcState::Halted;
            } else if ctx.start_allowed && ctx.conds.all_on(&svc.conds) && run_gate_clear {
                svc.state = SvcState::Ready;
            }
        }

        SvcState::Ready => start(svc, ctx),

        SvcState::Running => {
            let stop = svc.flags.stop_requested
                || !eligible(svc, ctx.level)
                || ctx.conds.any_off(&svc.conds)
                || (svc.flags.changed && !svc.sighup);
            if stop {
                begin_stop(svc, ctx);
            }
        }

        SvcState::Stopping => {
            // Inetd records have no process; they halt as soon as their
            // listener is gone.
            if svc.pid.is_none() {
                finish_halt(svc, ctx);
            }
        }

        SvcState::Crashed | SvcState::Blocked => {
            // A record scheduled for deletion must not sit out a backoff.
            if svc.flags.removal {
                finish_halt(svc, ctx);
            }
        }

        SvcState::Dead => {}
    }

    svc.state != from
}

/// READY is transient: fork/exec (or register the listener) right away.
fn start(svc: &mut Svc, ctx: &mut StepCtx) {
    if svc.ty == SvcType::Inetd {
        let conf = match &svc.inetd {
            Some(conf) => conf.clone(),
            None => {
                warn!("{}: inetd record without socket config", svc.ident());
                svc.state = SvcState::Halted;
                return;
            }
        };

        match ctx.inetd.register(svc.key(), &conf) {
            Ok(()) => {
                svc.state = SvcState::Running;
                svc.flags.changed = false;
                ctx.conds.set(&svc.cond_name());
            }
            Err(e) => {
                warn!("{}: cannot register listener: {}", svc.ident(), e);
                crash(svc, ctx);
            }
        }
        return;
    }

    match ctx.children.spawn(svc, ctx.env) {
        Ok(pid) => {
            svc.pid = Some(pid);
            svc.state = SvcState::Running;
            svc.flags.changed = false;
            svc.flags.kill_escalated = false;
            svc.flags.starting = true;
            if !svc.is_forking() {
                // Forking daemons assert their condition from the pidfile
                // watcher once their own pidfile shows up.
                svc.flags.starting = false;
                ctx.conds.set(&svc.cond_name());
            }
        }
        Err(e) => {
            warn!("{}: start failed: {}", svc.ident(), e);
            crash(svc, ctx);
        }
    }
}

fn crash(svc: &mut Svc, ctx: &mut StepCtx) {
    svc.pid = None;
    svc.flags.starting = false;
    ctx.conds.clear(&svc.cond_name());

    let storm = svc.note_exit(Instant::now());
    // Exits still inside the window drive the backoff, so a long healthy
    // run naturally resets it.
    svc.crash_count = svc.restart_history.len() as u32;

    if storm {
        block(svc);
    } else {
        svc.state = SvcState::Crashed;
        ctx.timers.arm(TimerKey::Backoff(svc.key()), svc.backoff());
    }
}

fn block(svc: &mut Svc) {
    svc.state = SvcState::Blocked;
    svc.blocked_reason = format!(
        "{} restarts within the last minute, not starting again until told to",
        svc.restart_history.len()
    );
    warn!("{} blocked: {}", svc.ident(), svc.blocked_reason);
}

fn begin_stop(svc: &mut Svc, ctx: &mut StepCtx) {
    svc.flags.stop_requested = false;
    svc.state = SvcState::Stopping;

    if svc.ty == SvcType::Inetd {
        ctx.inetd.unregister(&svc.key());
        finish_halt(svc, ctx);
        return;
    }

    match svc.pid {
        Some(pid) => {
            info!("stopping {}[{}]", svc.ident(), pid);
            ctx.children.kill_group(pid, svc.stop_signal);
            svc.flags.kill_escalated = false;
            ctx.timers
                .arm(TimerKey::KillDeadline(svc.key()), ctx.kill_delay);
        }
        None => finish_halt(svc, ctx),
    }
}

fn finish_halt(svc: &mut Svc, ctx: &mut StepCtx) {
    ctx.conds.clear(&svc.cond_name());
    ctx.conds.clear(&svc.pid_cond_name());
    ctx.children.remove_pidfile(svc);
    ctx.timers.cancel_svc(&svc.key());
    svc.flags.starting = false;
    svc.flags.kill_escalated = false;
    svc.pid = None;
    svc.state = if svc.flags.removal {
        SvcState::Dead
    } else {
        SvcState::Halted
    };
}

/// A reaped exit for this record, delivered by the child supervisor.
pub fn handle_exit(svc: &mut Svc, kind: ExitKind, ctx: &mut StepCtx) {
    let pid = svc.pid.take();
    svc.flags.starting = false;

    match svc.state {
        SvcState::Stopping => {
            debug!("{} stopped ({:?})", svc.ident(), kind);
            finish_halt(svc, ctx);

            // A replaced sysv script is told to stop as well.
            if svc.ty == SvcType::Sysv && !eligible(svc, ctx.level) {
                let _ = ctx
                    .children
                    .oneshot(&svc.cmd, &["stop".to_string()], ctx.env);
            }
        }

        SvcState::Running | SvcState::Ready => {
            if svc.ty.is_oneshot() {
                if kind.success() {
                    debug!("{} completed", svc.ident());
                } else {
                    warn!(
                        "{} exited with code {}",
                        svc.ident(),
                        kind.logical_code()
                    );
                }
                svc.flags.completed = true;
                svc.crash_count = 0;
                finish_halt(svc, ctx);
            } else {
                info!(
                    "{}[{}] exited with code {}, scheduling restart",
                    svc.ident(),
                    pid.map(|p| p.as_raw()).unwrap_or(0),
                    kind.logical_code()
                );
                crash(svc, ctx);
            }
        }

        other => {
            debug!("{}: exit in state {:?} ignored", svc.ident(), other);
            finish_halt(svc, ctx);
        }
    }
}

/// Kill-deadline expiry: escalate SIGTERM to SIGKILL, rearmed once so the
/// final reap still has a deadline.
pub fn handle_kill_deadline(svc: &mut Svc, ctx: &mut StepCtx) {
    if svc.state != SvcState::Stopping {
        return;
    }

    let Some(pid) = svc.pid else {
        finish_halt(svc, ctx);
        return;
    };

    if svc.flags.kill_escalated {
        warn!("{}[{}] survived SIGKILL, leaving it be", svc.ident(), pid);
        return;
    }

    info!(
        "{}[{}] did not stop in time, sending SIGKILL",
        svc.ident(),
        pid
    );
    ctx.children
        .kill_group(pid, nix::sys::signal::Signal::SIGKILL);
    svc.flags.kill_escalated = true;
    ctx.timers
        .arm(TimerKey::KillDeadline(svc.key()), ctx.kill_delay);
}

/// Backoff expiry: a crashed record may try again.
pub fn handle_backoff(svc: &mut Svc) {
    if svc.state == SvcState::Crashed {
        svc.state = SvcState::Waiting;
    }
}
