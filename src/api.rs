use std::fs;
use std::path::Path;

use eyre::WrapErr;
use nix::sys::stat::{umask, Mode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::svc::{Svc, SvcState, SvcType};
use crate::Result;

/// Magic sentinel of the legacy /dev/initctl request record.
pub const INIT_MAGIC: u32 = 0x0309_1969;

/// Fixed frame: magic + cmd + runlevel + sleeptime + data.
pub const FRAME_LEN: usize = 384;
pub const DATA_LEN: usize = 368;

pub const SNAPSHOT_LEN: usize = 256;

/// Protocol commands. The low range is left to the historical telinit
/// record; supervisor extensions start at 16.
pub mod cmd {
    pub const RUNLVL: u32 = 1;
    pub const RELOAD: u32 = 16;
    pub const DEBUG: u32 = 17;
    pub const START: u32 = 18;
    pub const STOP: u32 = 19;
    pub const RESTART: u32 = 20;
    pub const QUERY: u32 = 21;
    pub const EMIT: u32 = 22;
    pub const GET_RUNLEVEL: u32 = 23;
    pub const SVC_ITER: u32 = 24;
    pub const SVC_FIND: u32 = 25;
    pub const INETD_QUERY: u32 = 26;
    pub const WDOG_HELLO: u32 = 27;
    pub const ACK: u32 = 254;
    pub const NACK: u32 = 255;
}

/// One request/response frame. ACK/NACK replies reuse the frame with the
/// command replaced.
#[derive(Debug, Clone)]
pub struct Request {
    pub cmd: u32,
    pub runlevel: i32,
    pub sleeptime: i32,
    pub data: [u8; DATA_LEN],
}

impl Request {
    pub fn new(cmd: u32) -> Request {
        Request {
            cmd,
            runlevel: 0,
            sleeptime: 0,
            data: [0; DATA_LEN],
        }
    }

    pub fn with_data(cmd: u32, data: &str) -> Request {
        let mut rq = Request::new(cmd);
        rq.set_data(data);
        rq
    }

    pub fn set_data(&mut self, data: &str) {
        self.data = [0; DATA_LEN];
        let bytes = data.as_bytes();
        let len = bytes.len().min(DATA_LEN - 1);
        self.data[..len].copy_from_slice(&bytes[..len]);
    }

    /// NUL-terminated data payload as text.
    pub fn data_str(&self) -> &str {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DATA_LEN);
        std::str::from_utf8(&self.data[..end]).unwrap_or("")
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&INIT_MAGIC.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.cmd.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.runlevel.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.sleeptime.to_ne_bytes());
        buf[16..].copy_from_slice(&self.data);
        buf
    }

    /// Reject short frames and bad magic.
    pub fn decode(buf: &[u8]) -> Option<Request> {
        if buf.len() != FRAME_LEN {
            return None;
        }

        let magic = u32::from_ne_bytes(buf[0..4].try_into().ok()?);
        if magic != INIT_MAGIC {
            return None;
        }

        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&buf[16..]);
        Some(Request {
            cmd: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
            runlevel: i32::from_ne_bytes(buf[8..12].try_into().ok()?),
            sleeptime: i32::from_ne_bytes(buf[12..16].try_into().ok()?),
            data,
        })
    }
}

/// Fixed-size record snapshot streamed by the enumeration and find
/// commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvcSnapshot {
    pub job: u32,
    pub pid: i32,
    pub runlevels: u16,
    pub state: u8,
    pub ty: u8,
    pub flags: u8,
    pub crashes: u8,
    pub name: String,
    pub instance: String,
    pub cmd: String,
    pub desc: String,
}

pub mod snapshot_flags {
    pub const CHANGED: u8 = 1;
    pub const STARTING: u8 = 2;
    pub const MANUAL: u8 = 4;
    pub const PROTECTED: u8 = 8;
    pub const REMOVAL: u8 = 16;
}

fn state_code(state: SvcState) -> u8 {
    match state {
        SvcState::Halted => 0,
        SvcState::Waiting => 1,
        SvcState::Ready => 2,
        SvcState::Running => 3,
        SvcState::Stopping => 4,
        SvcState::Crashed => 5,
        SvcState::Blocked => 6,
        SvcState::Dead => 7,
    }
}

fn type_code(ty: SvcType) -> u8 {
    match ty {
        SvcType::Service => 0,
        SvcType::Task => 1,
        SvcType::Run => 2,
        SvcType::Sysv => 3,
        SvcType::Tty => 4,
        SvcType::Inetd => 5,
    }
}

impl SvcSnapshot {
    pub fn of(svc: &Svc) -> SvcSnapshot {
        let mut flags = 0u8;
        if svc.flags.changed {
            flags |= snapshot_flags::CHANGED;
        }
        if svc.flags.starting {
            flags |= snapshot_flags::STARTING;
        }
        if svc.flags.manual {
            flags |= snapshot_flags::MANUAL;
        }
        if svc.flags.protected {
            flags |= snapshot_flags::PROTECTED;
        }
        if svc.flags.removal {
            flags |= snapshot_flags::REMOVAL;
        }

        SvcSnapshot {
            job: svc.job,
            pid: svc.pid.map(|p| p.as_raw()).unwrap_or(0),
            runlevels: svc.runlevels.raw(),
            state: state_code(svc.state),
            ty: type_code(svc.ty),
            flags,
            crashes: svc.restart_history.len().min(255) as u8,
            name: svc.name.clone(),
            instance: svc.instance.clone(),
            cmd: svc.cmd.display().to_string(),
            desc: svc.desc.clone(),
        }
    }

    /// The "no such record" marker, mirroring the legacy pid -1 reply.
    pub fn empty() -> SvcSnapshot {
        SvcSnapshot {
            job: 0,
            pid: -1,
            runlevels: 0,
            state: 0,
            ty: 0,
            flags: 0,
            crashes: 0,
            name: String::new(),
            instance: String::new(),
            cmd: String::new(),
            desc: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pid == -1 && self.job == 0
    }

    pub fn encode(&self) -> [u8; SNAPSHOT_LEN] {
        let mut buf = [0u8; SNAPSHOT_LEN];
        buf[0..4].copy_from_slice(&self.job.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.pid.to_ne_bytes());
        buf[8..10].copy_from_slice(&self.runlevels.to_ne_bytes());
        buf[10] = self.state;
        buf[11] = self.ty;
        buf[12] = self.flags;
        buf[13] = self.crashes;
        put_str(&mut buf[16..48], &self.name);
        put_str(&mut buf[48..64], &self.instance);
        put_str(&mut buf[64..192], &self.cmd);
        put_str(&mut buf[192..256], &self.desc);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<SvcSnapshot> {
        if buf.len() != SNAPSHOT_LEN {
            return None;
        }

        Some(SvcSnapshot {
            job: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            pid: i32::from_ne_bytes(buf[4..8].try_into().ok()?),
            runlevels: u16::from_ne_bytes(buf[8..10].try_into().ok()?),
            state: buf[10],
            ty: buf[11],
            flags: buf[12],
            crashes: buf[13],
            name: get_str(&buf[16..48]),
            instance: get_str(&buf[48..64]),
            cmd: get_str(&buf[64..192]),
            desc: get_str(&buf[192..256]),
        })
    }

    pub fn state_str(&self) -> &'static str {
        match self.state {
            0 => "halted",
            1 => "waiting",
            2 => "ready",
            3 => "running",
            4 => "stopping",
            5 => "crashed",
            6 => "blocked",
            7 => "dead",
            _ => "unknown",
        }
    }
}

fn put_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(buf.len() - 1);
    buf[..len].copy_from_slice(&bytes[..len]);
}

fn get_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Listening side of the control socket. Binding failure at boot is one
/// of the few fatal errors.
pub struct ApiServer {
    listener: UnixListener,
}

impl ApiServer {
    pub fn bind(path: &Path) -> Result<ApiServer> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Control socket is owner-only.
        let old = umask(Mode::from_bits_truncate(0o077));
        let listener = UnixListener::bind(path);
        umask(old);

        let listener =
            listener.wrap_err_with(|| format!("cannot bind API socket {}", path.display()))?;
        debug!("API socket listening on {}", path.display());
        Ok(ApiServer { listener })
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

/// Read one frame; None on clean EOF, short read or bad magic (the caller
/// closes the connection).
pub async fn read_frame(stream: &mut UnixStream) -> Option<Request> {
    let mut buf = [0u8; FRAME_LEN];
    match stream.read_exact(&mut buf).await {
        Ok(_) => Request::decode(&buf),
        Err(_) => None,
    }
}

pub async fn write_frame(stream: &mut UnixStream, rq: &Request) -> std::io::Result<()> {
    stream.write_all(&rq.encode()).await
}

pub async fn write_snapshot(stream: &mut UnixStream, snap: &SvcSnapshot) -> std::io::Result<()> {
    stream.write_all(&snap.encode()).await
}

/// Minimal client used by tests and external tooling: one request per
/// connection, returns the ACK/NACK frame.
pub async fn send_request(path: &Path, rq: &Request) -> std::io::Result<Request> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(&rq.encode()).await?;

    let mut buf = [0u8; FRAME_LEN];
    stream.read_exact(&mut buf).await?;
    Request::decode(&buf)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad reply frame"))
}

/// Client side of the enumeration command: stream snapshots until EOF.
pub async fn enumerate(path: &Path) -> std::io::Result<Vec<SvcSnapshot>> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(&Request::new(cmd::SVC_ITER).encode()).await?;

    let mut snapshots = Vec::new();
    let mut buf = [0u8; SNAPSHOT_LEN];
    loop {
        match stream.read_exact(&mut buf).await {
            Ok(_) => match SvcSnapshot::decode(&buf) {
                Some(snap) if !snap.is_empty() => snapshots.push(snap),
                _ => break,
            },
            Err(_) => break,
        }
    }

    Ok(snapshots)
}
