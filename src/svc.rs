use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::resource::Resource;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::inetd::InetdConf;
use crate::log_sink::LogSink;

/// Registry key: (job id, instance id). Job ids are assigned monotonically
/// at first registration and stay stable across reloads.
pub type SvcKey = (u32, String);

/// Default restart storm window and cap: more than `RESTART_CAP` exits
/// inside `RESTART_WINDOW` blocks the record.
pub const RESTART_WINDOW: Duration = Duration::from_secs(60);
pub const RESTART_CAP: u32 = 10;

/// Backoff between a crash and the next start attempt, scaled by the
/// number of crashes in the window and capped.
pub const BACKOFF_STEP: Duration = Duration::from_secs(2);
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcType {
    /// Long-running supervised daemon, respawned on exit.
    Service,
    /// One-shot command, started in parallel with its level.
    Task,
    /// One-shot command, serialized in declaration order within a level.
    Run,
    /// SysV-style script, invoked with a "start" argument.
    Sysv,
    /// Getty on a terminal device, respawned on exit.
    Tty,
    /// Socket-activated service; "running" means the socket is registered.
    Inetd,
}

impl SvcType {
    /// Daemons are respawned and assert their `svc/` condition while up.
    pub fn is_daemon(self) -> bool {
        matches!(self, SvcType::Service | SvcType::Tty | SvcType::Inetd)
    }

    pub fn is_oneshot(self) -> bool {
        matches!(self, SvcType::Task | SvcType::Run | SvcType::Sysv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcState {
    Halted,
    Waiting,
    Ready,
    Running,
    Stopping,
    Crashed,
    Blocked,
    /// Terminal state for deleted records awaiting removal from the registry.
    Dead,
}

impl SvcState {
    pub fn as_str(self) -> &'static str {
        match self {
            SvcState::Halted => "halted",
            SvcState::Waiting => "waiting",
            SvcState::Ready => "ready",
            SvcState::Running => "running",
            SvcState::Stopping => "stopping",
            SvcState::Crashed => "crashed",
            SvcState::Blocked => "blocked",
            SvcState::Dead => "dead",
        }
    }
}

/// 10-bit set over runlevels 0..9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunlevelMask(u16);

impl RunlevelMask {
    pub const EMPTY: RunlevelMask = RunlevelMask(0);

    /// Complement base for a leading `!`: [1..9] excluding 6.
    const COMPLEMENT: u16 = 0b11_1011_1110;

    /// Parse a runlevel field such as `[2345]`, `[S]` or `[!6]`.
    ///
    /// Digits 0..9 select levels, `S`/`s` is an alias for level 1
    /// (single user) and a leading `!` complements against [1..9]\{6}.
    /// Unknown characters are skipped. A missing field defaults to [234].
    pub fn parse(field: Option<&str>) -> RunlevelMask {
        let field = match field {
            Some(f) => f,
            None => return RunlevelMask(0b0001_1100),
        };

        let mut mask = 0u16;
        let mut invert = false;
        for ch in field.trim_start_matches('[').trim_end_matches(']').chars() {
            match ch {
                '!' => {
                    invert = true;
                    mask = Self::COMPLEMENT;
                }
                'S' | 's' => {
                    if invert {
                        mask &= !(1 << 1);
                    } else {
                        mask |= 1 << 1;
                    }
                }
                '0'..='9' => {
                    let level = ch as u16 - '0' as u16;
                    if invert {
                        mask &= !(1 << level);
                    } else {
                        mask |= 1 << level;
                    }
                }
                _ => {}
            }
        }

        RunlevelMask(mask)
    }

    pub fn from_raw(raw: u16) -> RunlevelMask {
        RunlevelMask(raw & 0x3FF)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn contains(self, level: u8) -> bool {
        level <= 9 && self.0 & (1 << level as u16) != 0
    }

    pub fn with(mut self, level: u8) -> RunlevelMask {
        if level <= 9 {
            self.0 |= 1 << level as u16;
        }
        self
    }
}

/// How the record's pidfile is managed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidfilePolicy {
    /// Supervisor writes `<run-dir>/<name>.pid` on start, removes it on halt.
    Implicit,
    /// Supervisor writes the given path instead of the default.
    Explicit(PathBuf),
    /// A forking daemon writes the file itself; the supervisor only reads
    /// it to learn the PID.
    Foreign(PathBuf),
}

/// Soft/hard limit for one resource. `None` leaves the inherited value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitRule {
    pub resource: Resource,
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

/// Getty parameters from a `tty` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyConf {
    pub dev: PathBuf,
    pub baud: Option<String>,
    pub term: Option<String>,
    pub noclear: bool,
    pub nowait: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SvcFlags {
    /// Configuration differs from the running instance (set by reconcile).
    pub changed: bool,
    /// Started but not yet confirmed up (forking daemons: pidfile pending).
    pub starting: bool,
    /// Only started on explicit request, never by runlevel alone.
    pub manual: bool,
    /// Latch set by an explicit start request for a manual record.
    pub forced: bool,
    /// Must not be stopped or swept by reconcile (watchdog handover).
    pub protected: bool,
    /// Defining file disappeared; drive to HALTED and delete.
    pub removal: bool,
    /// Sweep marker used by the reconciler's mark pass.
    pub dynamic_mark: bool,
    /// Operator asked for a stop; observed on the next step.
    pub stop_requested: bool,
    /// Operator hold: stopped by request, not restarted until a start.
    pub stopped: bool,
    /// One-shot record already ran at this level; cleared when the level
    /// is left so the next entry runs it again.
    pub completed: bool,
    /// SIGKILL already sent after the stop deadline expired.
    pub kill_escalated: bool,
}

/// One configured service, task, run, sysv, tty or inetd entry.
#[derive(Debug, Clone)]
pub struct Svc {
    pub job: u32,
    pub instance: String,
    pub ty: SvcType,
    /// Short name: basename of the command, or the `name:` override.
    pub name: String,
    pub cmd: PathBuf,
    pub args: Vec<String>,
    pub desc: String,
    pub runlevels: RunlevelMask,
    /// Conjunction of condition facts gating WAITING → READY.
    pub conds: Vec<String>,
    /// Whether the process accepts a reconfigure signal (SIGHUP) instead
    /// of a stop/start cycle on configuration change.
    pub sighup: bool,
    pub pidfile: PidfilePolicy,
    pub stop_signal: Signal,
    pub restart_cap: u32,
    pub log: LogSink,
    pub rlimits: Vec<RlimitRule>,
    pub cgroup: String,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Configuration file this record came from; None for built-ins.
    pub origin: Option<PathBuf>,
    pub inetd: Option<InetdConf>,
    pub tty: Option<TtyConf>,

    pub state: SvcState,
    pub pid: Option<Pid>,
    pub flags: SvcFlags,
    pub blocked_reason: String,
    /// Ring of recent exit timestamps for restart windowing.
    pub restart_history: VecDeque<Instant>,
    /// Consecutive crashes since the last healthy run, drives backoff.
    pub crash_count: u32,
}

impl Svc {
    pub fn new(ty: SvcType, cmd: PathBuf) -> Svc {
        let name = cmd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| cmd.to_string_lossy().into_owned());

        Svc {
            job: 0,
            instance: String::new(),
            ty,
            name,
            cmd,
            args: Vec::new(),
            desc: String::new(),
            runlevels: RunlevelMask::parse(None),
            conds: Vec::new(),
            sighup: ty.is_daemon(),
            pidfile: PidfilePolicy::Implicit,
            stop_signal: Signal::SIGTERM,
            restart_cap: RESTART_CAP,
            log: LogSink::Null,
            rlimits: Vec::new(),
            cgroup: String::new(),
            user: None,
            group: None,
            origin: None,
            inetd: None,
            tty: None,
            state: SvcState::Halted,
            pid: None,
            flags: SvcFlags::default(),
            blocked_reason: String::new(),
            restart_history: VecDeque::new(),
            crash_count: 0,
        }
    }

    pub fn key(&self) -> SvcKey {
        (self.job, self.instance.clone())
    }

    /// Human-readable identity for logs: `name:instance` or just `name`.
    pub fn ident(&self) -> String {
        if self.instance.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.instance)
        }
    }

    /// The condition fact this record asserts while running, e.g.
    /// `svc//sbin/ntpd` or `svc//sbin/ntpd:2` for an instance.
    pub fn cond_name(&self) -> String {
        if self.instance.is_empty() {
            format!("svc/{}", self.cmd.display())
        } else {
            format!("svc/{}:{}", self.cmd.display(), self.instance)
        }
    }

    /// The `pid/` fact reasserted by the pidfile watcher.
    pub fn pid_cond_name(&self) -> String {
        format!("pid/{}", self.ident())
    }

    /// A forking daemon writes its own pidfile; we adopt the PID from it.
    pub fn is_forking(&self) -> bool {
        matches!(self.pidfile, PidfilePolicy::Foreign(_))
    }

    /// Resolved pidfile path for this record.
    pub fn pidfile_path(&self, run_dir: &Path) -> PathBuf {
        match &self.pidfile {
            PidfilePolicy::Implicit => run_dir.join(format!("{}.pid", self.ident())),
            PidfilePolicy::Explicit(p) | PidfilePolicy::Foreign(p) => p.clone(),
        }
    }

    /// Records sharing identity are matched across reloads; attribute
    /// equality decides whether the match is flagged "changed".
    pub fn config_eq(&self, other: &Svc) -> bool {
        self.ty == other.ty
            && self.cmd == other.cmd
            && self.args == other.args
            && self.desc == other.desc
            && self.runlevels == other.runlevels
            && self.conds == other.conds
            && self.sighup == other.sighup
            && self.pidfile == other.pidfile
            && self.stop_signal == other.stop_signal
            && self.restart_cap == other.restart_cap
            && self.log == other.log
            && self.rlimits == other.rlimits
            && self.cgroup == other.cgroup
            && self.user == other.user
            && self.group == other.group
            && self.flags.manual == other.flags.manual
            && self.inetd == other.inetd
            && self.tty == other.tty
    }

    /// Copy parsed attributes from a candidate, preserving runtime state.
    pub fn absorb(&mut self, cand: &Svc) {
        self.ty = cand.ty;
        self.name = cand.name.clone();
        self.cmd = cand.cmd.clone();
        self.args = cand.args.clone();
        self.desc = cand.desc.clone();
        self.runlevels = cand.runlevels;
        self.conds = cand.conds.clone();
        self.sighup = cand.sighup;
        self.pidfile = cand.pidfile.clone();
        self.stop_signal = cand.stop_signal;
        self.restart_cap = cand.restart_cap;
        self.log = cand.log.clone();
        self.rlimits = cand.rlimits.clone();
        self.cgroup = cand.cgroup.clone();
        self.user = cand.user.clone();
        self.group = cand.group.clone();
        self.origin = cand.origin.clone();
        self.inetd = cand.inetd.clone();
        self.tty = cand.tty.clone();
        self.flags.manual = cand.flags.manual;
    }

    /// Record an exit and report whether the restart window overflowed.
    pub fn note_exit(&mut self, now: Instant) -> bool {
        self.restart_history.push_back(now);
        while let Some(front) = self.restart_history.front() {
            if now.duration_since(*front) > RESTART_WINDOW {
                self.restart_history.pop_front();
            } else {
                break;
            }
        }

        self.restart_history.len() as u32 >= self.restart_cap
    }

    /// Backoff before the next start attempt after a crash.
    pub fn backoff(&self) -> Duration {
        let d = BACKOFF_STEP * self.crash_count.max(1);
        d.min(BACKOFF_MAX)
    }

    pub fn reset_restart_history(&mut self) {
        self.restart_history.clear();
        self.crash_count = 0;
        self.blocked_reason.clear();
    }
}
