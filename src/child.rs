use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use eyre::eyre;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Gid, Pid, Uid};
use tracing::{debug, info, warn};
use users::{get_group_by_name, get_user_by_name};

use crate::environment::Environment;
use crate::log_sink::LogSink;
use crate::svc::{PidfilePolicy, Svc, SvcType};
use crate::Result;

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(Signal),
}

impl ExitKind {
    /// Logical exit code: a signal-killed process reports failure even if
    /// its raw status would read as zero.
    pub fn logical_code(self) -> i32 {
        match self {
            ExitKind::Exited(code) => code,
            ExitKind::Signaled(sig) => 128 + sig as i32,
        }
    }

    pub fn success(self) -> bool {
        self.logical_code() == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExitEvent {
    pub pid: Pid,
    pub kind: ExitKind,
}

/// The only component that spawns and reaps processes.
///
/// Children are started with `std::process::Command` plus a pre-exec hook
/// that resets the signal mask, calls setsid, applies resource limits and
/// drops privileges; the child handle is dropped immediately and every
/// exit is collected by the SIGCHLD-driven `reap` loop instead.
pub struct ChildSupervisor {
    run_dir: PathBuf,
}

impl ChildSupervisor {
    pub fn new(run_dir: &Path) -> ChildSupervisor {
        ChildSupervisor {
            run_dir: run_dir.to_path_buf(),
        }
    }

    pub fn spawn(&self, svc: &Svc, env: &Environment) -> Result<Pid> {
        self.spawn_with_stdio(svc, env, None)
    }

    /// Spawn the record's command; for inetd children `conn` becomes
    /// stdin/stdout/stderr.
    pub fn spawn_with_stdio(
        &self,
        svc: &Svc,
        env: &Environment,
        conn: Option<OwnedFd>,
    ) -> Result<Pid> {
        let mut command = Command::new(&svc.cmd);
        command.args(&svc.args);
        if svc.ty == SvcType::Sysv {
            command.arg("start");
        }

        command.env_clear();
        for (key, value) in env.iter() {
            command.env(key, value);
        }

        match conn {
            Some(fd) => {
                let out = fd.try_clone()?;
                let err = fd.try_clone()?;
                command.stdin(Stdio::from(fd));
                command.stdout(Stdio::from(out));
                command.stderr(Stdio::from(err));
            }
            None => {
                let (stdin, out, err) = self.stdio_for(svc)?;
                command.stdin(stdin);
                command.stdout(out);
                command.stderr(err);
            }
        }

        let ids = resolve_ids(svc)?;
        let rlimits = resolve_rlimits(svc)?;

        if !svc.cgroup.is_empty() {
            debug!("{}: cgroup {} selected (external controller)", svc.ident(), svc.cgroup);
        }

        unsafe {
            command.pre_exec(move || {
                use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

                // Children must not inherit the supervisor's signal mask.
                let empty = SigSet::empty();
                pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&empty), None)
                    .map_err(io_err)?;

                nix::unistd::setsid().map_err(io_err)?;
                nix::unistd::chdir("/").map_err(io_err)?;

                for (resource, soft, hard) in &rlimits {
                    setrlimit(*resource, *soft, *hard).map_err(io_err)?;
                }

                if let Some((uid, gid, user)) = &ids {
                    nix::unistd::setgid(*gid).map_err(io_err)?;
                    let _ = nix::unistd::initgroups(user, *gid);
                    nix::unistd::setuid(*uid).map_err(io_err)?;
                }

                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| eyre!("cannot exec {}: {}", svc.cmd.display(), e))?;
        let pid = Pid::from_raw(child.id() as i32);

        // The handle is dropped on purpose; the SIGCHLD reaper owns exits.
        drop(child);

        if !svc.is_forking() {
            self.write_pidfile(svc, pid);
        }

        info!("{}[{}] started", svc.ident(), pid);
        Ok(pid)
    }

    /// Fire-and-forget helper for sysv stop scripts, runparts entries and
    /// the shutdown command.
    pub fn oneshot(&self, cmd: &Path, args: &[String], env: &Environment) -> Result<Pid> {
        let mut command = Command::new(cmd);
        command.args(args);
        command.env_clear();
        for (key, value) in env.iter() {
            command.env(key, value);
        }
        command.stdin(Stdio::null());

        unsafe {
            command.pre_exec(|| {
                use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
                let empty = SigSet::empty();
                pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&empty), None)
                    .map_err(io_err)?;
                nix::unistd::setsid().map_err(io_err)?;
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        drop(child);
        Ok(pid)
    }

    /// Reap every exited child with WNOHANG and classify the exits.
    pub fn reap(&self) -> Vec<ExitEvent> {
        let mut events = Vec::new();

        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    debug!("reaped {} with exit status {}", pid, code);
                    events.push(ExitEvent {
                        pid,
                        kind: ExitKind::Exited(code),
                    });
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    debug!("reaped {} killed by {:?}", pid, sig);
                    events.push(ExitEvent {
                        pid,
                        kind: ExitKind::Signaled(sig),
                    });
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    debug!("ignoring wait status {:?}", status);
                }
                Err(nix::Error::ECHILD) => break,
                Err(e) => {
                    warn!("error reaping children: {}", e);
                    break;
                }
            }
        }

        events
    }

    /// Signal the whole process group the child leads (it called setsid).
    pub fn kill_group(&self, pid: Pid, sig: Signal) {
        let group = Pid::from_raw(-pid.as_raw());
        match kill(group, sig) {
            Ok(()) => debug!("sent {:?} to process group {}", sig, pid),
            Err(nix::Error::ESRCH) => {}
            Err(e) => warn!("cannot signal process group {}: {}", pid, e),
        }
    }

    /// Deliver a single signal to the child itself (reconfigure signal).
    pub fn signal(&self, pid: Pid, sig: Signal) {
        match kill(pid, sig) {
            Ok(()) => debug!("sent {:?} to {}", sig, pid),
            Err(nix::Error::ESRCH) => {}
            Err(e) => warn!("cannot signal {}: {}", pid, e),
        }
    }

    pub fn write_pidfile(&self, svc: &Svc, pid: Pid) {
        let path = svc.pidfile_path(&self.run_dir);
        if let Err(e) = fs::write(&path, format!("{}\n", pid)) {
            warn!("cannot write pidfile {}: {}", path.display(), e);
        }
    }

    pub fn remove_pidfile(&self, svc: &Svc) {
        if svc.is_forking() {
            return;
        }
        let path = svc.pidfile_path(&self.run_dir);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot remove pidfile {}: {}", path.display(), e),
        }
    }

    fn stdio_for(&self, svc: &Svc) -> Result<(Stdio, Stdio, Stdio)> {
        let open_both = |path: &Path| -> Result<(Stdio, Stdio)> {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let err = file.try_clone()?;
            Ok((Stdio::from(file), Stdio::from(err)))
        };

        match &svc.log {
            LogSink::Off => Ok((Stdio::null(), Stdio::inherit(), Stdio::inherit())),
            LogSink::Null => Ok((Stdio::null(), Stdio::null(), Stdio::null())),
            // A console record (rescue shell) talks to the console in
            // both directions.
            LogSink::Console => {
                let console = Path::new("/dev/console");
                let opened = std::fs::File::open(console).and_then(|stdin| {
                    let out = OpenOptions::new().append(true).open(console)?;
                    let err = out.try_clone()?;
                    Ok((stdin, out, err))
                });
                match opened {
                    Ok((stdin, out, err)) => {
                        Ok((Stdio::from(stdin), Stdio::from(out), Stdio::from(err)))
                    }
                    Err(e) => {
                        debug!("{}: cannot open console ({}), output dropped", svc.ident(), e);
                        Ok((Stdio::null(), Stdio::null(), Stdio::null()))
                    }
                }
            }
            LogSink::File { path, .. } => {
                let (out, err) = open_both(path)?;
                Ok((Stdio::null(), out, err))
            }
            // Syslog transport lives outside the supervisor.
            LogSink::Syslog { .. } => Ok((Stdio::null(), Stdio::null(), Stdio::null())),
        }
    }
}

/// Read a PID from a (possibly foreign) pidfile.
pub fn read_pidfile(path: &Path) -> Option<Pid> {
    let content = fs::read_to_string(path).ok()?;
    let pid: i32 = content.trim().parse().ok()?;
    if pid > 0 {
        Some(Pid::from_raw(pid))
    } else {
        None
    }
}

fn io_err(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

type ResolvedIds = Option<(Uid, Gid, CString)>;

fn resolve_ids(svc: &Svc) -> Result<ResolvedIds> {
    let user = match &svc.user {
        Some(user) => user,
        None => return Ok(None),
    };

    let pw = get_user_by_name(user).ok_or_else(|| eyre!("unknown user: {}", user))?;
    let gid = match &svc.group {
        Some(group) => {
            let gr =
                get_group_by_name(group).ok_or_else(|| eyre!("unknown group: {}", group))?;
            Gid::from_raw(gr.gid())
        }
        None => Gid::from_raw(pw.primary_group_id()),
    };

    let cname = CString::new(user.as_str()).map_err(|_| eyre!("bad user name: {}", user))?;
    Ok(Some((Uid::from_raw(pw.uid()), gid, cname)))
}

/// Resolve partial soft/hard rules against the currently inherited limits.
fn resolve_rlimits(svc: &Svc) -> Result<Vec<(Resource, u64, u64)>> {
    let mut resolved = Vec::with_capacity(svc.rlimits.len());
    for rule in &svc.rlimits {
        let (cur_soft, cur_hard) = getrlimit(rule.resource)?;
        let soft = rule.soft.unwrap_or(cur_soft);
        let hard = rule.hard.unwrap_or(cur_hard);
        resolved.push((rule.resource, soft.min(hard), hard));
    }
    Ok(resolved)
}
