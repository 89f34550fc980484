use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::sys::resource::Resource;
use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::environment::Environment;
use crate::inetd::{port_for_service, Builtin, InetdConf, InetdFilter, Proto};
use crate::log_sink::{LogSink, DEFAULT_ROTATE_COUNT, DEFAULT_ROTATE_SIZE};
use crate::svc::{PidfilePolicy, RlimitRule, RunlevelMask, Svc, SvcType, TtyConf};

const MAX_INCLUDE_DEPTH: usize = 8;

/// Settings that apply to the system as a whole rather than one record.
/// The bootstrap-only ones are ignored outside runlevel 0.
#[derive(Debug, Clone)]
pub struct GlobalSettings {
    pub hostname: Option<String>,
    pub modules: Vec<String>,
    pub mknods: Vec<String>,
    pub network: Option<PathBuf>,
    pub runparts: Option<PathBuf>,
    pub shutdown_cmd: Option<String>,
    /// Target level after bootstrap, [1..9] excluding 6.
    pub target_runlevel: u8,
    pub rotate_size: u64,
    pub rotate_count: u32,
    /// cgroup definitions: name -> controller property string.
    pub cgroups: HashMap<String, String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        GlobalSettings {
            hostname: None,
            modules: Vec::new(),
            mknods: Vec::new(),
            network: None,
            runparts: None,
            shutdown_cmd: None,
            target_runlevel: 2,
            rotate_size: DEFAULT_ROTATE_SIZE,
            rotate_count: DEFAULT_ROTATE_COUNT,
            cgroups: HashMap::new(),
        }
    }
}

/// Everything one full parse produces: global settings, candidate service
/// records and the tracked child environment.
#[derive(Default)]
pub struct ParseOutcome {
    pub settings: GlobalSettings,
    pub candidates: Vec<Svc>,
    pub env: Environment,
}

struct Parser {
    bootstrap: bool,
    getty: PathBuf,
    settings: GlobalSettings,
    candidates: Vec<Svc>,
    env: Environment,
    /// rlimit directives seen in the main file; the starting point for
    /// every drop-dir file's own defaults.
    global_rlimits: Vec<RlimitRule>,
}

/// Parse the main configuration file plus every `*.conf` under the config
/// directory and its `enabled/` subdirectory.
///
/// Parsing is total: unknown directives and malformed lines are logged
/// and skipped, a missing file only produces a warning.
pub fn load(conf_file: &Path, conf_dir: &Path, bootstrap: bool, getty: &Path) -> ParseOutcome {
    let mut parser = Parser {
        bootstrap,
        getty: getty.to_path_buf(),
        settings: GlobalSettings::default(),
        candidates: Vec::new(),
        env: Environment::baseline(),
        global_rlimits: Vec::new(),
    };

    let mut main_rlimits = Vec::new();
    let mut main_cgroup = String::new();
    parser.parse_file(conf_file, &mut main_rlimits, &mut main_cgroup, 0);
    parser.global_rlimits = main_rlimits;

    for path in conf_dir_files(conf_dir) {
        let mut rlimits = parser.global_rlimits.clone();
        let mut cgroup = String::new();
        parser.parse_file(&path, &mut rlimits, &mut cgroup, 0);
    }

    ParseOutcome {
        settings: parser.settings,
        candidates: parser.candidates,
        env: parser.env,
    }
}

/// Collect `*.conf` files under the directory and its `enabled/`
/// subdirectory, in lexical order, resolving symlinks and skipping
/// dangling ones.
fn conf_dir_files(conf_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in [conf_dir.to_path_buf(), conf_dir.join("enabled")] {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        let mut batch: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();

            let meta = match fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    debug!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            if meta.file_type().is_symlink() && fs::metadata(&path).is_err() {
                warn!("skipping {}, dangling symlink", path.display());
                continue;
            }

            if fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(true) {
                debug!("skipping directory {}", path.display());
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) != Some("conf") {
                debug!("skipping {}, not a .conf file", path.display());
                continue;
            }

            batch.push(path);
        }

        batch.sort();
        files.extend(batch);
    }

    files
}

impl Parser {
    fn parse_file(
        &mut self,
        path: &Path,
        rlimits: &mut Vec<RlimitRule>,
        cgroup_current: &mut String,
        depth: usize,
    ) {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                return;
            }
        };

        debug!("parsing {}", path.display());
        for raw in content.lines() {
            let line = raw.replace('\t', " ");
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            self.parse_line(line, path, rlimits, cgroup_current, depth);
        }
    }

    fn parse_line(
        &mut self,
        line: &str,
        origin: &Path,
        rlimits: &mut Vec<RlimitRule>,
        cgroup_current: &mut String,
        depth: usize,
    ) {
        let (word, rest) = match line.split_once(' ') {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };

        match word {
            "host" | "hostname" if self.bootstrap => {
                self.settings.hostname = Some(rest.to_string());
            }
            "host" | "hostname" => {}

            "module" if self.bootstrap => self.settings.modules.push(rest.to_string()),
            "module" => {}

            "mknod" if self.bootstrap => self.settings.mknods.push(rest.to_string()),
            "mknod" => {}

            "network" if self.bootstrap => self.settings.network = Some(PathBuf::from(rest)),
            "network" => {}

            "runparts" if self.bootstrap => self.settings.runparts = Some(PathBuf::from(rest)),
            "runparts" => {}

            "runlevel" if self.bootstrap => {
                match rest.trim().parse::<u8>() {
                    Ok(n) if (1..=9).contains(&n) && n != 6 => self.settings.target_runlevel = n,
                    _ => {
                        warn!("not a valid runlevel ({}), valid levels are [1-9] excluding 6", rest);
                    }
                }
            }
            "runlevel" => {}

            "include" => {
                if depth >= MAX_INCLUDE_DEPTH {
                    warn!("include depth exceeded at {}", rest);
                    return;
                }
                let file = PathBuf::from(rest.trim());
                if !file.exists() {
                    warn!("cannot find include file {}, absolute path required", rest);
                    return;
                }
                self.parse_file(&file, rlimits, cgroup_current, depth + 1);
            }

            "shutdown" => self.settings.shutdown_cmd = Some(rest.to_string()),

            "log" => self.parse_log_policy(rest),

            "rlimit" => {
                if let Some(rule) = parse_rlimit(rest) {
                    merge_rlimit(rlimits, rule);
                } else {
                    warn!("rlimit: parse error: {}", rest);
                }
            }

            "cgroup" => {
                let mut toks = rest.split_whitespace();
                match toks.next() {
                    Some(name) if !name.contains("..") && !name.contains('/') => {
                        let config = toks.collect::<Vec<_>>().join(",");
                        self.settings.cgroups.insert(name.to_string(), config);
                    }
                    _ => warn!("cgroup: illegal name in: {}", rest),
                }
            }

            "service" | "task" | "run" | "sysv" => {
                let ty = match word {
                    "service" => SvcType::Service,
                    "task" => SvcType::Task,
                    "run" => SvcType::Run,
                    _ => SvcType::Sysv,
                };
                match self.parse_svc_line(ty, rest, rlimits, cgroup_current) {
                    Some(svc) => self.register(svc, origin),
                    None => warn!("skipping malformed {} line: {}", word, rest),
                }
            }

            "tty" => match self.parse_tty_line(rest, rlimits, cgroup_current) {
                Some(svc) => self.register(svc, origin),
                None => warn!("skipping malformed tty line: {}", rest),
            },

            "inetd" => match self.parse_inetd_line(rest, rlimits, cgroup_current) {
                Some(svc) => self.register(svc, origin),
                None => warn!("skipping malformed inetd line: {}", rest),
            },

            _ if word.starts_with("cgroup.") => {
                *cgroup_current = word["cgroup.".len()..].to_string();
            }

            _ if line.contains('=') => self.parse_env_line(line),

            _ => debug!("unknown directive, skipping: {}", line),
        }
    }

    /// `log size:BYTES count:N` global rotation policy.
    fn parse_log_policy(&mut self, rest: &str) {
        for tok in rest.split_whitespace() {
            if let Some(v) = tok.strip_prefix("size:") {
                match parse_bytes(v) {
                    Some(n) => self.settings.rotate_size = n,
                    None => warn!("log: invalid size: {}", v),
                }
            } else if let Some(v) = tok.strip_prefix("count:") {
                match v.parse() {
                    Ok(n) => self.settings.rotate_count = n,
                    Err(_) => warn!("log: invalid count: {}", v),
                }
            }
        }
    }

    /// `KEY=VALUE`, quoted values unwrapped; tracked for reload un-set.
    fn parse_env_line(&mut self, line: &str) {
        let (key, val) = match line.split_once('=') {
            Some(kv) => kv,
            None => return,
        };

        let key = key.trim();
        if key.is_empty() || key.contains(' ') {
            debug!("unknown directive, skipping: {}", line);
            return;
        }

        let mut val = val.trim();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = &val[1..val.len() - 1];
        }

        self.env.set(key, val);
    }

    fn register(&mut self, mut svc: Svc, origin: &Path) {
        svc.origin = Some(origin.to_path_buf());
        self.candidates.push(svc);
    }

    /// Common parser for service/task/run/sysv lines:
    /// `[LVLS] <COND> [opts] /path args -- description`
    fn parse_svc_line(
        &mut self,
        ty: SvcType,
        rest: &str,
        rlimits: &[RlimitRule],
        cgroup_current: &str,
    ) -> Option<Svc> {
        let mut toks = rest.split_whitespace().peekable();

        let mut runlevels = None;
        let mut conds = Vec::new();
        let mut sighup = ty.is_daemon();
        let mut pidfile = PidfilePolicy::Implicit;
        let mut stop_signal = Signal::SIGTERM;
        let mut restart_cap = None;
        let mut name = None;
        let mut instance = String::new();
        let mut manual = false;
        let mut log_spec: Option<Option<String>> = None;
        let mut user = None;
        let mut group = None;

        let cmd = loop {
            let tok = toks.next()?;

            if tok.starts_with('[') {
                runlevels = Some(RunlevelMask::parse(Some(tok)));
            } else if tok.starts_with('<') {
                let inner = tok.trim_start_matches('<').trim_end_matches('>');
                let inner = match inner.strip_prefix('!') {
                    Some(stripped) => {
                        sighup = false;
                        stripped
                    }
                    None => inner,
                };
                conds = inner
                    .split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
            } else if tok == "log" {
                log_spec = Some(None);
            } else if let Some(spec) = tok.strip_prefix("log:") {
                log_spec = Some(Some(spec.to_string()));
            } else if tok == "pid" {
                pidfile = PidfilePolicy::Implicit;
            } else if let Some(spec) = tok.strip_prefix("pid:") {
                pidfile = match spec.strip_prefix('!') {
                    Some(path) => PidfilePolicy::Foreign(PathBuf::from(path)),
                    None => PidfilePolicy::Explicit(PathBuf::from(spec)),
                };
            } else if let Some(sig) = tok.strip_prefix("kill:") {
                match parse_signal(sig) {
                    Some(s) => stop_signal = s,
                    None => warn!("invalid kill signal: {}", sig),
                }
            } else if let Some(n) = tok.strip_prefix("name:") {
                name = Some(n.to_string());
            } else if let Some(n) = tok.strip_prefix("restart:") {
                match n.parse() {
                    Ok(v) => restart_cap = Some(v),
                    Err(_) => warn!("invalid restart cap: {}", n),
                }
            } else if let Some(v) = tok.strip_prefix("manual:") {
                manual = matches!(v, "yes" | "on" | "true" | "1");
            } else if let Some(id) = tok.strip_prefix(':') {
                instance = id.to_string();
            } else if let Some(ug) = tok.strip_prefix('@') {
                match ug.split_once(':') {
                    Some((u, g)) => {
                        user = Some(u.to_string());
                        group = Some(g.to_string());
                    }
                    None => user = Some(ug.to_string()),
                }
            } else if tok.starts_with('/') {
                break tok;
            } else {
                warn!("unknown option, skipping: {}", tok);
            }
        };

        let mut args = Vec::new();
        let mut desc = Vec::new();
        let mut in_desc = false;
        for tok in toks {
            if tok == "--" {
                in_desc = true;
            } else if in_desc {
                desc.push(tok);
            } else {
                args.push(tok.to_string());
            }
        }

        let mut svc = Svc::new(ty, PathBuf::from(cmd));
        if let Some(name) = name {
            svc.name = name;
        }
        svc.args = args;
        svc.desc = desc.join(" ");
        svc.instance = instance;
        if let Some(mask) = runlevels {
            svc.runlevels = mask;
        }
        svc.conds = conds;
        svc.sighup = sighup;
        svc.pidfile = pidfile;
        svc.stop_signal = stop_signal;
        if let Some(cap) = restart_cap {
            svc.restart_cap = cap;
        }
        svc.flags.manual = manual;
        svc.user = user;
        svc.group = group;
        svc.rlimits = rlimits.to_vec();
        svc.cgroup = cgroup_current.to_string();
        svc.log = match log_spec {
            Some(spec) => LogSink::parse(
                spec.as_deref(),
                &svc.name,
                self.settings.rotate_size,
                self.settings.rotate_count,
            ),
            None => LogSink::Null,
        };

        Some(svc)
    }

    /// `tty [LVLS] DEV [BAUD] [noclear] [nowait] [TERM]`, or a full
    /// command line whose first word is the getty to exec.
    fn parse_tty_line(
        &mut self,
        rest: &str,
        rlimits: &[RlimitRule],
        cgroup_current: &str,
    ) -> Option<Svc> {
        let mut runlevels = None;
        let mut dev: Option<PathBuf> = None;
        let mut cmd: Option<PathBuf> = None;
        let mut args = Vec::new();
        let mut baud = None;
        let mut term = None;
        let mut noclear = false;
        let mut nowait = false;

        for tok in rest.split_whitespace() {
            if cmd.is_some() {
                if tok.starts_with("/dev/") && dev.is_none() {
                    dev = Some(PathBuf::from(tok));
                }
                args.push(tok.to_string());
            } else if tok.starts_with('[') {
                runlevels = Some(RunlevelMask::parse(Some(tok)));
            } else if tok.starts_with("/dev/") {
                dev = Some(PathBuf::from(tok));
            } else if tok.starts_with('/') {
                cmd = Some(PathBuf::from(tok));
            } else if tok.chars().all(|c| c.is_ascii_digit() || c == ',') {
                baud = Some(tok.to_string());
            } else if tok == "noclear" {
                noclear = true;
            } else if tok == "nowait" {
                nowait = true;
            } else {
                term = Some(tok.to_string());
            }
        }

        let dev = match (&cmd, dev) {
            (_, Some(dev)) => dev,
            (Some(_), None) => PathBuf::from("/dev/console"),
            (None, None) => return None,
        };

        let tty = TtyConf {
            dev: dev.clone(),
            baud: baud.clone(),
            term: term.clone(),
            noclear,
            nowait,
        };

        let mut svc = match cmd {
            Some(cmd) => {
                let mut svc = Svc::new(SvcType::Tty, cmd);
                svc.args = args;
                svc
            }
            None => {
                // Built-in form: exec the configured getty on the device.
                let mut svc = Svc::new(SvcType::Tty, self.getty.clone());
                svc.args = vec![dev.to_string_lossy().into_owned()];
                if let Some(baud) = &baud {
                    svc.args.push(baud.clone());
                }
                if let Some(term) = &term {
                    svc.args.push(term.clone());
                }
                svc
            }
        };

        let devname = dev
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        svc.name = devname.clone();
        svc.conds.push(format!("dev/{}", devname));
        if let Some(mask) = runlevels {
            svc.runlevels = mask;
        }
        // A getty cannot reconfigure on SIGHUP; changes mean stop/start.
        svc.sighup = false;
        svc.tty = Some(tty);
        svc.rlimits = rlimits.to_vec();
        svc.cgroup = cgroup_current.to_string();

        Some(svc)
    }

    /// `inetd SVC/PROTO[@IFLIST] {wait|nowait} [LVLS] /path args`; the
    /// command `internal` selects a built-in handler.
    fn parse_inetd_line(
        &mut self,
        rest: &str,
        rlimits: &[RlimitRule],
        cgroup_current: &str,
    ) -> Option<Svc> {
        let mut toks = rest.split_whitespace();

        let spec = toks.next()?;
        let (svcproto, iflist) = match spec.split_once('@') {
            Some((s, i)) => (s, Some(i)),
            None => (spec, None),
        };
        let (svcname, proto) = svcproto.split_once('/')?;
        let proto = match proto {
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            other => {
                warn!("unsupported inetd protocol: {}", other);
                return None;
            }
        };

        let port = match svcname.parse::<u16>() {
            Ok(p) => p,
            Err(_) => match port_for_service(svcname) {
                Some(p) => p,
                None => {
                    warn!("unknown inetd service: {}", svcname);
                    return None;
                }
            },
        };

        let filters = iflist
            .map(|list| {
                list.split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| match s.strip_prefix('!') {
                        Some(iface) => InetdFilter {
                            deny: true,
                            iface: iface.to_string(),
                        },
                        None => InetdFilter {
                            deny: false,
                            iface: s.to_string(),
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();

        let wait = match toks.next()? {
            "wait" => true,
            "nowait" => false,
            other => {
                warn!("inetd: expected wait/nowait, got {}", other);
                return None;
            }
        };

        let mut runlevels = None;
        let mut cmd = None;
        let mut args = Vec::new();
        for tok in toks {
            if cmd.is_some() {
                args.push(tok.to_string());
            } else if tok.starts_with('[') {
                runlevels = Some(RunlevelMask::parse(Some(tok)));
            } else if tok.starts_with('/') || tok == "internal" {
                cmd = Some(tok.to_string());
            }
        }
        let cmd = cmd?;

        let builtin = if cmd == "internal" {
            match Builtin::for_service(svcname) {
                Some(b) => Some(b),
                None => {
                    warn!("no internal inetd handler for {}", svcname);
                    return None;
                }
            }
        } else {
            None
        };

        let mut svc = Svc::new(SvcType::Inetd, PathBuf::from(&cmd));
        svc.name = svcname.to_string();
        svc.args = args;
        // Socket changes need the listener re-registered, not a signal.
        svc.sighup = false;
        if let Some(mask) = runlevels {
            svc.runlevels = mask;
        }
        svc.inetd = Some(InetdConf {
            name: svcname.to_string(),
            proto,
            port,
            wait,
            filters,
            builtin,
        });
        svc.rlimits = rlimits.to_vec();
        svc.cgroup = cgroup_current.to_string();

        Some(svc)
    }
}

/// `rlimit [soft|hard|both] RESOURCE VALUE`; the two-token form implies
/// `both`. `unlimited`/`infinity` lift the limit.
fn parse_rlimit(rest: &str) -> Option<RlimitRule> {
    let toks: Vec<&str> = rest.split_whitespace().collect();
    let (level, res, val) = match toks.as_slice() {
        [res, val] => ("both", *res, *val),
        [level, res, val] => (*level, *res, *val),
        _ => return None,
    };

    let resource = resource_by_name(res)?;
    let value = if val == "unlimited" || val == "infinity" {
        u64::MAX
    } else {
        val.parse().ok()?
    };

    let rule = match level {
        "soft" => RlimitRule {
            resource,
            soft: Some(value),
            hard: None,
        },
        "hard" => RlimitRule {
            resource,
            soft: None,
            hard: Some(value),
        },
        "both" => RlimitRule {
            resource,
            soft: Some(value),
            hard: Some(value),
        },
        _ => return None,
    };

    Some(rule)
}

fn merge_rlimit(rules: &mut Vec<RlimitRule>, rule: RlimitRule) {
    for existing in rules.iter_mut() {
        if existing.resource == rule.resource {
            if rule.soft.is_some() {
                existing.soft = rule.soft;
            }
            if rule.hard.is_some() {
                existing.hard = rule.hard;
            }
            return;
        }
    }
    rules.push(rule);
}

fn resource_by_name(name: &str) -> Option<Resource> {
    let resource = match name {
        "as" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "locks" => Resource::RLIMIT_LOCKS,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "msgqueue" => Resource::RLIMIT_MSGQUEUE,
        "nice" => Resource::RLIMIT_NICE,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "rss" => Resource::RLIMIT_RSS,
        "rtprio" => Resource::RLIMIT_RTPRIO,
        "rttime" => Resource::RLIMIT_RTTIME,
        "sigpending" => Resource::RLIMIT_SIGPENDING,
        "stack" => Resource::RLIMIT_STACK,
        _ => return None,
    };
    Some(resource)
}

/// Signal by number (`kill:15`) or name (`kill:TERM`, `kill:SIGTERM`).
fn parse_signal(spec: &str) -> Option<Signal> {
    if let Ok(num) = spec.parse::<i32>() {
        return Signal::try_from(num).ok();
    }

    let name = spec.to_ascii_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{}", name)
    };
    Signal::from_str(&name).ok()
}

/// `200000`, `200k`, `1M` style byte counts.
fn parse_bytes(spec: &str) -> Option<u64> {
    let spec = spec.trim();
    if let Ok(n) = spec.parse::<u64>() {
        return Some(n);
    }

    let (num, suffix) = spec.split_at(spec.len().checked_sub(1)?);
    let base: u64 = num.parse().ok()?;
    match suffix {
        "k" | "K" => Some(base * 1024),
        "m" | "M" => Some(base * 1024 * 1024),
        "g" | "G" => Some(base * 1024 * 1024 * 1024),
        _ => None,
    }
}
