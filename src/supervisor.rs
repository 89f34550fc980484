use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::reboot::RebootMode;
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{self, cmd, ApiServer, SvcSnapshot};
use crate::child::ChildSupervisor;
use crate::cli::Config;
use crate::cond::CondStore;
use crate::conf::{self, GlobalSettings};
use crate::conf_watch::ConfWatcher;
use crate::dev_watch::{DevEvent, DevWatcher};
use crate::environment::Environment;
use crate::inetd::{InetdConn, InetdEngine};
use crate::pidfile::{self, PidfileEvent, PidfileWatcher};
use crate::reconcile;
use crate::registry::Registry;
use crate::runlevel::{level_from_char, Governor, HaltKind};
use crate::signals::{Sig, Signals};
use crate::state::{self, StepCtx};
use crate::svc::{Svc, SvcKey, SvcState, SvcType};
use crate::timer::{TimerKey, TimerQueue};
use crate::Result;

/// Handle to swap the log filter at runtime (API debug toggle).
pub type LogHandle = tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// One wakeup of the event loop; polled with biased priority so children
/// are reaped before inotify traffic, inotify before API requests and API
/// requests before timers.
enum Event {
    Signal(Option<Sig>),
    Pidfile(Option<PidfileEvent>),
    Conf(Option<PathBuf>),
    Dev(Option<DevEvent>),
    Inetd(Option<InetdConn>),
    Api(std::io::Result<UnixStream>),
    Timer(TimerKey),
    ReapTick,
}

/// Owns every piece of supervisor state and runs the single-threaded
/// event loop. All mutation happens on the loop thread; child processes
/// share nothing with it.
pub struct Supervisor {
    cfg: Config,
    settings: GlobalSettings,
    env: Environment,
    registry: Registry,
    conds: CondStore,
    children: ChildSupervisor,
    timers: TimerQueue,
    governor: Governor,
    inetd: InetdEngine,
    signals: Signals,
    conf_watch: ConfWatcher,
    pid_watch: PidfileWatcher,
    dev_watch: Option<DevWatcher>,
    api: ApiServer,
    log_handle: Option<LogHandle>,
    debug: bool,
    /// Files reported changed since the last reload; informational.
    pending_conf: HashSet<PathBuf>,
    /// Children spawned for inetd connections, for wait-mode resumption.
    inetd_children: HashMap<Pid, SvcKey>,
    /// Record holding the watchdog, protected from reconcile sweeps.
    wdog: Option<SvcKey>,
    runparts_done: bool,
}

impl Supervisor {
    pub fn new(cfg: Config, log_handle: Option<LogHandle>) -> Result<Supervisor> {
        std::fs::create_dir_all(&cfg.run_dir)?;

        let conds = CondStore::new(&cfg.run_dir)?;
        let children = ChildSupervisor::new(&cfg.run_dir);
        let signals = Signals::new()?;
        let conf_watch = ConfWatcher::new(&cfg.conf_file, &cfg.conf_dir)?;
        let pid_watch = PidfileWatcher::new(&cfg.run_dir)?;
        let api = ApiServer::bind(&cfg.socket)?;

        let dev_watch = match DevWatcher::new(&cfg.dev_dir) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("device hotplug watch unavailable: {}", e);
                None
            }
        };

        Ok(Supervisor {
            cfg,
            settings: GlobalSettings::default(),
            env: Environment::baseline(),
            registry: Registry::new(),
            conds,
            children,
            timers: TimerQueue::new(),
            governor: Governor::new(),
            inetd: InetdEngine::new(),
            signals,
            conf_watch,
            pid_watch,
            dev_watch,
            api,
            log_handle,
            debug: false,
            pending_conf: HashSet::new(),
            inetd_children: HashMap::new(),
            wdog: None,
            runparts_done: false,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.bootstrap();

        let mut reap_interval = tokio::time::interval(self.cfg.reap_interval);
        reap_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let event = {
                let Supervisor {
                    signals,
                    pid_watch,
                    conf_watch,
                    dev_watch,
                    inetd,
                    api,
                    timers,
                    ..
                } = self;

                tokio::select! {
                    biased;
                    sig = signals.next() => Event::Signal(sig),
                    ev = pid_watch.next() => Event::Pidfile(ev),
                    path = conf_watch.next() => Event::Conf(path),
                    ev = next_dev(dev_watch) => Event::Dev(ev),
                    conn = inetd.next_conn() => Event::Inetd(conn),
                    conn = api.accept() => Event::Api(conn),
                    key = timers.next_expired() => Event::Timer(key),
                    _ = reap_interval.tick() => Event::ReapTick,
                }
            };

            match event {
                Event::Signal(Some(sig)) => self.on_signal(sig),
                Event::Signal(None) => {}
                Event::Pidfile(Some(ev)) => self.on_pidfile(ev),
                Event::Pidfile(None) => {}
                Event::Conf(Some(path)) => {
                    debug!("configuration change recorded: {}", path.display());
                    self.pending_conf.insert(path);
                }
                Event::Conf(None) => {}
                Event::Dev(Some(ev)) => self.on_dev(ev),
                Event::Dev(None) => {}
                Event::Inetd(Some(conn)) => self.on_inetd_conn(conn),
                Event::Inetd(None) => {}
                Event::Api(Ok(stream)) => self.handle_api(stream).await,
                Event::Api(Err(e)) => warn!("failed serving API request: {}", e),
                Event::Timer(key) => self.on_timer(key),
                Event::ReapTick => self.reap_and_step(),
            }

            if self.maybe_final_action() {
                return Ok(());
            }
        }
    }

    /// First boot: runlevel 0, parse everything, start level-0 records,
    /// then head for the configured target level once the bootstrap run
    /// sequence has drained.
    fn bootstrap(&mut self) {
        info!("entering bootstrap (runlevel 0)");
        self.reload();

        if let Some(hostname) = self.settings.hostname.clone() {
            if !Path::new("/etc/hostname").exists() {
                match nix::unistd::sethostname(&hostname) {
                    Ok(()) => info!("hostname set to {}", hostname),
                    Err(e) => warn!("cannot set hostname: {}", e),
                }
            }
        }

        for line in self.settings.mknods.clone() {
            let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if let Err(e) = self
                .children
                .oneshot(Path::new("/bin/mknod"), &args, &self.env)
            {
                warn!("mknod {}: {}", line, e);
            }
        }

        // Module loading, network bringup and cgroup controller writes
        // belong to external helpers; the definitions only ride along.
        for module in &self.settings.modules {
            debug!("kernel module {} left to the module loader", module);
        }
        if let Some(network) = &self.settings.network {
            debug!("network bringup script {} noted", network.display());
        }
        for (name, config) in &self.settings.cgroups {
            debug!("cgroup {} ({}) left to the controller", name, config);
        }

        self.maybe_leave_bootstrap();
    }

    // ------------------------------------------------------------------
    // event handlers

    fn on_signal(&mut self, sig: Sig) {
        debug!("received signal {:?}", sig);
        match sig {
            Sig::Child => self.reap_and_step(),
            // SIGHUP to PID 1 is the same as an API reload request.
            Sig::Hup => self.reload(),
            Sig::Int => {
                // Ctrl-Alt-Del on a real console.
                self.governor.set_halt(HaltKind::Reboot);
                self.request_runlevel(6);
            }
            Sig::Usr1 => {
                self.governor.set_halt(HaltKind::Halt);
                self.request_runlevel(0);
            }
            Sig::Usr2 | Sig::Power => {
                self.governor.set_halt(HaltKind::PowerOff);
                self.request_runlevel(0);
            }
            Sig::Term => {
                if nix::unistd::getpid().as_raw() == 1 {
                    debug!("ignoring SIGTERM as process 1");
                } else {
                    info!("SIGTERM received, shutting down");
                    self.governor.set_halt(HaltKind::Halt);
                    self.request_runlevel(0);
                }
            }
        }
    }

    fn reap_and_step(&mut self) {
        let exits = self.children.reap();
        if exits.is_empty() {
            return;
        }

        for exit in exits {
            if let Some(key) = self.registry.find_by_pid(exit.pid) {
                let (registry, mut ctx) = self.split();
                if let Some(svc) = registry.get_mut(&key) {
                    state::handle_exit(svc, exit.kind, &mut ctx);
                }
            } else if let Some(key) = self.inetd_children.remove(&exit.pid) {
                debug!("inetd child {} for job {} done", exit.pid, key.0);
                self.inetd.resume(&key);
            } else {
                debug!("reaped orphan {} ({:?})", exit.pid, exit.kind);
            }
        }

        self.converge();
    }

    fn on_pidfile(&mut self, event: PidfileEvent) {
        let (key, changed) =
            pidfile::apply_event(&event, &mut self.registry, &mut self.conds, &self.cfg.run_dir);
        if key.is_some() && !changed.is_empty() {
            self.step_fact_subscribers(&changed);
        }
    }

    fn on_dev(&mut self, event: DevEvent) {
        let (name, up) = match &event {
            DevEvent::Added(name) => (name, true),
            DevEvent::Removed(name) => (name, false),
        };
        let fact = format!("dev/{}", name);
        if !self.conds.has_subscriber(&fact) {
            return;
        }

        let changed = if up {
            self.conds.set(&fact)
        } else {
            self.conds.clear(&fact)
        };
        if changed {
            self.step_fact_subscribers(&[fact]);
        }
    }

    fn on_inetd_conn(&mut self, conn: InetdConn) {
        let svc = match self.registry.get(&conn.key) {
            Some(svc) if svc.state == SvcState::Running => svc,
            _ => {
                debug!("dropping connection for inactive inetd job {}", conn.key.0);
                self.inetd.resume(&conn.key);
                return;
            }
        };
        let wait = svc.inetd.as_ref().map(|c| c.wait).unwrap_or(false);

        match self.children.spawn_with_stdio(svc, &self.env, Some(conn.fd)) {
            Ok(pid) => {
                self.inetd_children.insert(pid, conn.key);
            }
            Err(e) => {
                warn!("inetd spawn failed: {}", e);
                if wait {
                    self.inetd.resume(&conn.key);
                }
            }
        }
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::KillDeadline(key) => {
                let (registry, mut ctx) = self.split();
                if let Some(svc) = registry.get_mut(&key) {
                    state::handle_kill_deadline(svc, &mut ctx);
                }
                self.converge();
            }
            TimerKey::Backoff(key) => {
                if let Some(svc) = self.registry.get_mut(&key) {
                    state::handle_backoff(svc);
                }
                self.converge();
            }
            TimerKey::RunlevelGrace => {
                if self.governor.in_stop_phase() {
                    warn!(
                        "runlevel {} stop phase did not finish in time, proceeding",
                        self.governor.current()
                    );
                    self.governor.finish_stop_phase();
                    self.converge();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // core orchestration

    /// Split self into the registry and the context every state-machine
    /// call needs; the borrows are disjoint fields.
    fn split(&mut self) -> (&mut Registry, StepCtx<'_>) {
        let Supervisor {
            registry,
            conds,
            children,
            timers,
            inetd,
            env,
            governor,
            cfg,
            ..
        } = self;

        let ctx = StepCtx {
            conds,
            children,
            timers,
            inetd,
            env,
            level: governor.current(),
            start_allowed: !governor.in_stop_phase(),
            kill_delay: cfg.kill_delay,
        };
        (registry, ctx)
    }

    /// Re-step everything to a fixed point, collect the dead, finish any
    /// pending runlevel transition and bootstrap progress.
    fn converge(&mut self) {
        self.settle();
        self.maybe_leave_bootstrap();
    }

    /// The convergence core: fixed-point stepping plus transition
    /// completion, without bootstrap handoff (which calls this itself).
    fn settle(&mut self) {
        {
            let (registry, mut ctx) = self.split();
            state::converge(registry, &mut ctx);
        }
        self.collect_dead();

        if self.governor.in_stop_phase() && !self.registry.any_stopping() {
            self.governor.finish_stop_phase();
            self.timers.cancel(&TimerKey::RunlevelGrace);
            let (registry, mut ctx) = self.split();
            state::converge(registry, &mut ctx);
            self.collect_dead();
        }
    }

    fn collect_dead(&mut self) {
        let dead: Vec<SvcKey> = self
            .registry
            .iter()
            .filter(|s| s.state == SvcState::Dead)
            .map(Svc::key)
            .collect();

        for key in dead {
            info!("removing job {}", key.0);
            self.inetd.unregister(&key);
            self.timers.cancel_svc(&key);
            if self.wdog.as_ref() == Some(&key) {
                self.wdog = None;
            }
            self.registry.remove(&key);
        }
    }

    fn step_fact_subscribers(&mut self, facts: &[String]) {
        let mut keys: Vec<SvcKey> = Vec::new();
        for fact in facts {
            for key in self.conds.subscribers(fact) {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        {
            let (registry, mut ctx) = self.split();
            for key in &keys {
                state::step_record(registry, key, &mut ctx);
            }
        }
        self.converge();
    }

    fn request_runlevel(&mut self, level: u8) {
        if !self.governor.request(level) {
            return;
        }
        self.timers.arm(TimerKey::RunlevelGrace, self.cfg.stop_grace);
        self.converge();
    }

    fn maybe_leave_bootstrap(&mut self) {
        if !self.governor.bootstrapping() {
            return;
        }
        if self.registry.runs_pending(0) {
            return;
        }

        if !self.runparts_done {
            self.runparts_done = true;
            if let Some(dir) = self.settings.runparts.clone() {
                self.run_parts(&dir);
            }
        }

        let target = match self.cfg.runlevel_override {
            Some(level) => level,
            None if self.cfg.single => 1,
            None => self.settings.target_runlevel,
        };

        info!("bootstrap complete, switching to runlevel {}", target);
        self.timers.arm(TimerKey::RunlevelGrace, self.cfg.stop_grace);
        self.governor.leave_bootstrap(target);
        self.settle();
    }

    /// Execute everything in the runparts directory, in lexical order.
    /// Bootstrap is the one place the supervisor runs commands serially.
    fn run_parts(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("runparts {}: {}", dir.display(), e);
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();

        for path in paths {
            use std::os::unix::fs::PermissionsExt;
            let executable = std::fs::metadata(&path)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false);
            if !executable {
                continue;
            }

            info!("runparts: {}", path.display());
            match std::process::Command::new(&path).status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("runparts {}: {}", path.display(), status),
                Err(e) => warn!("runparts {}: {}", path.display(), e),
            }
        }
    }

    /// Full reload: mark, sweep, resolve conditions, converge.
    pub fn reload(&mut self) {
        if self.pending_conf.is_empty() {
            info!("reloading configuration");
        } else {
            info!(
                "reloading configuration, {} file(s) changed on disk",
                self.pending_conf.len()
            );
        }
        self.pending_conf.clear();

        let bootstrap = self.governor.bootstrapping();
        let mut outcome = conf::load(
            &self.cfg.conf_file,
            &self.cfg.conf_dir,
            bootstrap,
            &self.cfg.getty,
        );

        // Rescue mode ignores the configured services entirely.
        if self.cfg.rescue {
            outcome.candidates.clear();
        }

        // Mark.
        self.registry.mark_dynamic();
        self.conds.mark_flux("svc/");
        self.conds.mark_flux("pid/");

        if bootstrap {
            self.settings = outcome.settings;
        } else {
            self.settings.shutdown_cmd = outcome.settings.shutdown_cmd;
            self.settings.rotate_size = outcome.settings.rotate_size;
            self.settings.rotate_count = outcome.settings.rotate_count;
            self.settings.cgroups = outcome.settings.cgroups;
        }

        self.env.transition(outcome.env);

        // Sweep.
        reconcile::sweep(&mut self.registry, outcome.candidates);
        if self.cfg.rescue && self.registry.find_all_by_name("rescue").is_empty() {
            self.register_rescue_shell();
        }

        // Changed records that accept a reconfigure signal get it instead
        // of a stop/start cycle.
        {
            let Supervisor {
                registry, children, ..
            } = self;
            for svc in registry.iter_mut() {
                if svc.flags.changed && svc.sighup && svc.state == SvcState::Running {
                    if let Some(pid) = svc.pid {
                        info!("{}[{}] reconfiguring on SIGHUP", svc.ident(), pid);
                        children.signal(pid, nix::sys::signal::Signal::SIGHUP);
                        svc.flags.changed = false;
                    }
                }
            }
        }

        // Every fact settles to ON or OFF before converge runs.
        reconcile::resolve_conditions(&self.registry, &mut self.conds, &self.cfg.run_dir);

        let entries: Vec<(SvcKey, Vec<String>)> = self
            .registry
            .iter()
            .map(|s| (s.key(), s.conds.clone()))
            .collect();
        self.conds
            .rebuild_index(entries.iter().map(|(k, c)| (k.clone(), c.as_slice())));

        self.prime_dev_facts();

        // Converge. Bootstrap handoff stays with the caller, so the first
        // boot can finish its bootstrap-only work before leaving level 0.
        self.settle();
    }

    /// Seed `dev/` facts for device nodes that already exist; the watcher
    /// only reports changes from here on.
    fn prime_dev_facts(&mut self) {
        let devs: Vec<String> = self
            .registry
            .iter()
            .flat_map(|s| s.conds.iter())
            .filter_map(|c| c.strip_prefix("dev/"))
            .map(str::to_string)
            .collect();

        for name in devs {
            let fact = format!("dev/{}", name);
            if self.cfg.dev_dir.join(&name).exists() {
                self.conds.set(&fact);
            } else {
                self.conds.clear(&fact);
            }
        }
    }

    /// Rescue mode fallback when no configuration could be read at all.
    fn register_rescue_shell(&mut self) {
        info!("entering rescue mode");
        let mut svc = Svc::new(SvcType::Tty, PathBuf::from("/bin/sh"));
        svc.name = "rescue".to_string();
        svc.desc = "rescue shell".to_string();
        svc.runlevels = crate::svc::RunlevelMask::EMPTY
            .with(1)
            .with(2)
            .with(3)
            .with(4)
            .with(5);
        svc.log = crate::log_sink::LogSink::Console;
        svc.flags.protected = true;
        self.registry.insert(svc);
    }

    // ------------------------------------------------------------------
    // shutdown

    /// Once a final runlevel has quiesced, run the configured shutdown
    /// command and issue the armed system call (as PID 1) or exit.
    fn maybe_final_action(&mut self) -> bool {
        if self.governor.halt_kind() == HaltKind::None {
            return false;
        }
        let level = self.governor.current();
        if level != 0 && level != 6 {
            return false;
        }
        if self.governor.in_stop_phase() || self.registry.any_active() {
            return false;
        }

        if let Some(cmdline) = self.settings.shutdown_cmd.clone() {
            let mut parts = cmdline.split_whitespace();
            if let Some(cmd) = parts.next() {
                let args: Vec<&str> = parts.collect();
                info!("running shutdown command: {}", cmdline);
                match std::process::Command::new(cmd).args(&args).status() {
                    Ok(_) => {}
                    Err(e) => warn!("shutdown command failed: {}", e),
                }
            }
        }

        nix::unistd::sync();

        let mode = match self.governor.halt_kind() {
            HaltKind::Halt => RebootMode::RB_HALT_SYSTEM,
            HaltKind::Reboot => RebootMode::RB_AUTOBOOT,
            _ => RebootMode::RB_POWER_OFF,
        };

        if nix::unistd::getpid().as_raw() == 1 {
            info!("issuing final system call for runlevel {}", level);
            if let Err(e) = nix::sys::reboot::reboot(mode) {
                error!("reboot syscall failed: {}", e);
            }
        } else {
            info!("runlevel {} reached, exiting", level);
        }
        true
    }

    // ------------------------------------------------------------------
    // external API

    async fn handle_api(&mut self, mut stream: UnixStream) {
        let rq = match tokio::time::timeout(
            Duration::from_secs(2),
            api::read_frame(&mut stream),
        )
        .await
        {
            Ok(Some(rq)) => rq,
            // Timeout, short read or bad magic all close the connection.
            _ => return,
        };

        let mut reply = rq.clone();
        let mut nack = false;

        match rq.cmd {
            cmd::RUNLVL => nack = !self.api_runlevel(rq.runlevel),
            cmd::RELOAD => self.reload(),
            cmd::DEBUG => self.toggle_debug(),
            cmd::START => nack = !self.api_start(rq.data_str()),
            cmd::STOP => nack = !self.api_stop(rq.data_str()),
            cmd::RESTART => nack = !self.api_restart(rq.data_str()),
            cmd::QUERY => {
                let missing = self.missing_tokens(rq.data_str());
                if !missing.is_empty() {
                    reply.set_data(&missing.join(" "));
                    nack = true;
                }
            }
            cmd::EMIT => self.api_emit(rq.data_str()),
            cmd::GET_RUNLEVEL => {
                reply.runlevel = self.governor.current() as i32;
                reply.sleeptime = self.governor.prev() as i32;
            }
            cmd::SVC_ITER => {
                let snapshots: Vec<SvcSnapshot> =
                    self.registry.iter().map(SvcSnapshot::of).collect();
                for snap in &snapshots {
                    if api::write_snapshot(&mut stream, snap).await.is_err() {
                        return;
                    }
                }
                let _ = api::write_snapshot(&mut stream, &SvcSnapshot::empty()).await;
                return;
            }
            cmd::SVC_FIND => {
                let snap = self
                    .find_one(rq.data_str())
                    .and_then(|key| self.registry.get(&key).map(SvcSnapshot::of))
                    .unwrap_or_else(SvcSnapshot::empty);
                let _ = api::write_snapshot(&mut stream, &snap).await;
                return;
            }
            cmd::INETD_QUERY => match self.api_inetd_query(rq.data_str()) {
                Some(text) => reply.set_data(&text),
                None => nack = true,
            },
            cmd::WDOG_HELLO => nack = !self.api_wdog_hello(rq.runlevel),
            other => {
                debug!("unsupported API command {}", other);
                nack = true;
            }
        }

        reply.cmd = if nack { cmd::NACK } else { cmd::ACK };
        let _ = api::write_frame(&mut stream, &reply).await;
    }

    fn api_runlevel(&mut self, raw: i32) -> bool {
        // The legacy record carries the level as a character.
        let level = match u32::try_from(raw).ok().and_then(char::from_u32) {
            Some(c) if c.is_ascii_graphic() => level_from_char(c),
            _ if (0..=9).contains(&raw) => Some(raw as u8),
            _ => None,
        };

        match level {
            Some(level) => {
                self.request_runlevel(level);
                true
            }
            None => {
                warn!("unsupported runlevel request: {}", raw);
                false
            }
        }
    }

    fn toggle_debug(&mut self) {
        self.debug = !self.debug;
        let filter = if self.debug { "debug" } else { "info" };
        info!("log level -> {}", filter);
        if let Some(handle) = &self.log_handle {
            if let Err(e) = handle.reload(EnvFilter::new(filter)) {
                warn!("cannot change log filter: {}", e);
            }
        }
    }

    /// Resolve a job string (`name[:id]` or `jobid[:id]` tokens) into
    /// record keys; unknown tokens are reported back.
    fn resolve_tokens(&self, input: &str) -> (Vec<SvcKey>, Vec<String>) {
        let mut keys = Vec::new();
        let mut missing = Vec::new();

        for tok in input.split_whitespace() {
            let (ident, id) = match tok.split_once(':') {
                Some((ident, id)) => (ident, Some(id)),
                None => (tok, None),
            };

            let found: Vec<SvcKey> = if let Ok(job) = ident.parse::<u32>() {
                match id {
                    Some(id) => self.registry.find_by_job(job, id).into_iter().collect(),
                    None => self.registry.find_all_by_job(job),
                }
            } else {
                match id {
                    Some(id) => self.registry.find_by_name(ident, id).into_iter().collect(),
                    None => self.registry.find_all_by_name(ident),
                }
            };

            if found.is_empty() {
                missing.push(tok.to_string());
            } else {
                keys.extend(found);
            }
        }

        (keys, missing)
    }

    fn find_one(&self, input: &str) -> Option<SvcKey> {
        let (keys, _) = self.resolve_tokens(input);
        keys.into_iter().next()
    }

    fn missing_tokens(&self, input: &str) -> Vec<String> {
        self.resolve_tokens(input).1
    }

    fn api_start(&mut self, input: &str) -> bool {
        let (keys, missing) = self.resolve_tokens(input);
        if !missing.is_empty() {
            return false;
        }

        for key in &keys {
            if let Some(svc) = self.registry.get_mut(key) {
                if svc.state == SvcState::Blocked {
                    svc.reset_restart_history();
                    svc.state = SvcState::Halted;
                }
                svc.flags.forced = true;
                svc.flags.stopped = false;
                svc.flags.stop_requested = false;
            }
        }
        self.step_keys(&keys);
        true
    }

    fn api_stop(&mut self, input: &str) -> bool {
        let (keys, missing) = self.resolve_tokens(input);
        if !missing.is_empty() {
            return false;
        }

        for key in &keys {
            if let Some(svc) = self.registry.get_mut(key) {
                svc.flags.forced = false;
                svc.flags.stopped = true;
                svc.flags.stop_requested = true;
            }
        }
        self.step_keys(&keys);
        true
    }

    fn api_restart(&mut self, input: &str) -> bool {
        let (keys, missing) = self.resolve_tokens(input);
        if !missing.is_empty() {
            return false;
        }

        for key in &keys {
            if let Some(svc) = self.registry.get_mut(key) {
                if svc.state == SvcState::Blocked {
                    svc.reset_restart_history();
                    svc.state = SvcState::Halted;
                }
                if svc.flags.manual {
                    svc.flags.forced = true;
                }
                svc.flags.stopped = false;
                svc.flags.completed = false;
                if svc.state == SvcState::Running {
                    svc.flags.stop_requested = true;
                }
            }
        }
        self.step_keys(&keys);
        true
    }

    fn step_keys(&mut self, keys: &[SvcKey]) {
        {
            let (registry, mut ctx) = self.split();
            for key in keys {
                state::step_record(registry, key, &mut ctx);
            }
        }
        self.converge();
    }

    /// `emit` command: `+fact` asserts, `-fact` retracts, a bare fact
    /// asserts; the RELOAD keyword triggers a reload.
    fn api_emit(&mut self, input: &str) {
        let mut changed = Vec::new();
        for tok in input.split_whitespace() {
            if tok.eq_ignore_ascii_case("reload") {
                self.reload();
                continue;
            }

            let (set, fact) = match tok.strip_prefix('-') {
                Some(fact) => (false, fact),
                None => (true, tok.strip_prefix('+').unwrap_or(tok)),
            };
            if fact.is_empty() {
                continue;
            }

            let edge = if set {
                self.conds.set(fact)
            } else {
                self.conds.clear(fact)
            };
            if edge {
                changed.push(fact.to_string());
            }
        }

        if !changed.is_empty() {
            self.step_fact_subscribers(&changed);
        }
    }

    fn api_inetd_query(&self, input: &str) -> Option<String> {
        let key = self.find_one(input)?;
        let svc = self.registry.get(&key)?;
        let conf = svc.inetd.as_ref()?;

        let proto = match conf.proto {
            crate::inetd::Proto::Tcp => "tcp",
            crate::inetd::Proto::Udp => "udp",
        };
        let filters: Vec<String> = conf
            .filters
            .iter()
            .map(|f| {
                if f.deny {
                    format!("!{}", f.iface)
                } else {
                    f.iface.clone()
                }
            })
            .collect();

        Some(format!(
            "{}/{} port {} {} @{}",
            conf.name,
            proto,
            conf.port,
            if conf.wait { "wait" } else { "nowait" },
            filters.join(",")
        ))
    }

    /// An external watchdog asks to take over: stop and unprotect the
    /// bundled one, protect the caller's record.
    fn api_wdog_hello(&mut self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }

        let key = match self.registry.find_by_pid(Pid::from_raw(pid)) {
            Some(key) => key,
            None => {
                warn!("watchdog hand-over: pid {} is not a registered service", pid);
                return false;
            }
        };

        if let Some(old) = self.wdog.take() {
            if old != key {
                if let Some(svc) = self.registry.get_mut(&old) {
                    info!("stopping and unprotecting {}", svc.ident());
                    svc.flags.protected = false;
                    svc.runlevels = crate::svc::RunlevelMask::EMPTY;
                    svc.flags.stop_requested = true;
                }
                self.step_keys(&[old]);
            }
        }

        if let Some(svc) = self.registry.get_mut(&key) {
            info!("watchdog hand-over to {}[{}]", svc.ident(), pid);
            svc.flags.protected = true;
        }
        self.wdog = Some(key);
        true
    }
}

async fn next_dev(watch: &mut Option<DevWatcher>) -> Option<DevEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}
