use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::OwnedFd;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::svc::SvcKey;
use crate::Result;

/// Seconds between 1900-01-01 and the UNIX epoch, for the time protocol.
const TIME_1900_OFFSET: u64 = 2_208_988_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// One allow/deny rule from the `@IFLIST` part of an inetd declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InetdFilter {
    pub deny: bool,
    pub iface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Echo,
    Discard,
    Daytime,
    Time,
}

impl Builtin {
    pub fn for_service(name: &str) -> Option<Builtin> {
        match name {
            "echo" => Some(Builtin::Echo),
            "discard" => Some(Builtin::Discard),
            "daytime" => Some(Builtin::Daytime),
            "time" => Some(Builtin::Time),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InetdConf {
    pub name: String,
    pub proto: Proto,
    pub port: u16,
    /// wait: one child at a time, accepting pauses until it exits.
    pub wait: bool,
    pub filters: Vec<InetdFilter>,
    pub builtin: Option<Builtin>,
}

/// Well-known ports for service names accepted in inetd declarations.
pub fn port_for_service(name: &str) -> Option<u16> {
    let port = match name {
        "echo" => 7,
        "discard" => 9,
        "daytime" => 13,
        "chargen" => 19,
        "ftp" => 21,
        "ssh" => 22,
        "telnet" => 23,
        "time" => 37,
        "tftp" => 69,
        "finger" => 79,
        "http" => 80,
        "pop3" => 110,
        "ntp" => 123,
        _ => return None,
    };
    Some(port)
}

/// Decide whether a connection accepted on `iface` passes the filter
/// list. Rules are evaluated in declaration order, first match wins; with
/// no matching rule, a non-empty allow set rejects and an empty one
/// accepts.
pub fn filter_allows(filters: &[InetdFilter], iface: &str) -> bool {
    for f in filters {
        if f.iface == iface {
            return !f.deny;
        }
    }

    !filters.iter().any(|f| !f.deny)
}

/// A connection for an externally-handled inetd service, delivered to the
/// supervisor to spawn the configured command with `fd` as its stdio.
pub struct InetdConn {
    pub key: SvcKey,
    pub iface: String,
    pub fd: OwnedFd,
}

struct Registration {
    task: JoinHandle<()>,
    resume_tx: Option<mpsc::Sender<()>>,
}

/// Listener engine for inetd records. "Running" for an inetd record means
/// its socket is registered here; each accepted connection either runs an
/// internal handler or is handed to the supervisor to spawn a child.
pub struct InetdEngine {
    tx: mpsc::UnboundedSender<InetdConn>,
    rx: mpsc::UnboundedReceiver<InetdConn>,
    registrations: HashMap<SvcKey, Registration>,
}

impl InetdEngine {
    pub fn new() -> InetdEngine {
        let (tx, rx) = mpsc::unbounded_channel();
        InetdEngine {
            tx,
            rx,
            registrations: HashMap::new(),
        }
    }

    pub fn is_registered(&self, key: &SvcKey) -> bool {
        self.registrations.contains_key(key)
    }

    /// Next connection needing an external child.
    pub async fn next_conn(&mut self) -> Option<InetdConn> {
        self.rx.recv().await
    }

    /// Resume accepting for a wait-type service whose child exited.
    pub fn resume(&mut self, key: &SvcKey) {
        if let Some(reg) = self.registrations.get(key) {
            if let Some(tx) = &reg.resume_tx {
                let _ = tx.try_send(());
            }
        }
    }

    pub fn register(&mut self, key: SvcKey, conf: &InetdConf) -> Result<()> {
        if self.registrations.contains_key(&key) {
            return Ok(());
        }

        let iface = conf
            .filters
            .iter()
            .find(|f| !f.deny && !f.iface.is_empty())
            .map(|f| f.iface.clone())
            .unwrap_or_default();

        let (resume_tx, resume_rx) = mpsc::channel(1);
        let resume_tx = if conf.wait { Some(resume_tx) } else { None };

        let task = match conf.proto {
            Proto::Tcp => {
                let listener = tcp_listener(conf.port, &iface)?;
                info!("inetd {} listening on tcp port {}", conf.name, conf.port);
                tokio::task::spawn_local(serve_tcp(
                    key.clone(),
                    conf.clone(),
                    iface,
                    listener,
                    self.tx.clone(),
                    resume_rx,
                ))
            }
            Proto::Udp => {
                let socket = udp_socket(conf.port, &iface)?;
                info!("inetd {} listening on udp port {}", conf.name, conf.port);
                tokio::task::spawn_local(serve_udp(
                    key.clone(),
                    conf.clone(),
                    iface,
                    socket,
                    self.tx.clone(),
                    resume_rx,
                ))
            }
        };

        self.registrations.insert(key, Registration { task, resume_tx });
        Ok(())
    }

    pub fn unregister(&mut self, key: &SvcKey) {
        if let Some(reg) = self.registrations.remove(key) {
            reg.task.abort();
            debug!("inetd listener for job {} removed", key.0);
        }
    }
}

impl Drop for InetdEngine {
    fn drop(&mut self) {
        for reg in self.registrations.values() {
            reg.task.abort();
        }
    }
}

fn tcp_listener(port: u16, iface: &str) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if !iface.is_empty() {
        socket.bind_device(Some(iface.as_bytes()))?;
    }

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    socket.set_nonblocking(true)?;

    Ok(TcpListener::from_std(socket.into())?)
}

fn udp_socket(port: u16, iface: &str) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if !iface.is_empty() {
        socket.bind_device(Some(iface.as_bytes()))?;
    }

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

async fn serve_tcp(
    key: SvcKey,
    conf: InetdConf,
    iface: String,
    listener: TcpListener,
    tx: mpsc::UnboundedSender<InetdConn>,
    mut resume_rx: mpsc::Receiver<()>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("inetd {}: accept failed: {}", conf.name, e);
                continue;
            }
        };
        debug!("inetd {}: connection from {}", conf.name, peer);

        if !filter_allows(&conf.filters, &iface) {
            debug!("inetd {}: connection on {:?} denied by filter", conf.name, iface);
            continue;
        }

        if let Some(builtin) = conf.builtin {
            tokio::task::spawn_local(handle_builtin_tcp(builtin, stream));
            continue;
        }

        let fd = match stream.into_std() {
            Ok(std_stream) => {
                if let Err(e) = std_stream.set_nonblocking(false) {
                    warn!("inetd {}: cannot restore blocking mode: {}", conf.name, e);
                    continue;
                }
                OwnedFd::from(std_stream)
            }
            Err(e) => {
                warn!("inetd {}: cannot detach stream: {}", conf.name, e);
                continue;
            }
        };

        if tx
            .send(InetdConn {
                key: key.clone(),
                iface: iface.clone(),
                fd,
            })
            .is_err()
        {
            return;
        }

        if conf.wait && resume_rx.recv().await.is_none() {
            return;
        }
    }
}

async fn serve_udp(
    key: SvcKey,
    conf: InetdConf,
    iface: String,
    socket: UdpSocket,
    tx: mpsc::UnboundedSender<InetdConn>,
    mut resume_rx: mpsc::Receiver<()>,
) {
    let mut buf = [0u8; 2048];
    loop {
        if let Some(builtin) = conf.builtin {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("inetd {}: recv failed: {}", conf.name, e);
                    continue;
                }
            };

            if !filter_allows(&conf.filters, &iface) {
                continue;
            }

            let reply = match builtin {
                Builtin::Echo => buf[..len].to_vec(),
                Builtin::Time => time_1900().to_be_bytes().to_vec(),
                Builtin::Daytime => daytime_string().into_bytes(),
                Builtin::Discard => continue,
            };
            if let Err(e) = socket.send_to(&reply, peer).await {
                warn!("inetd {}: send failed: {}", conf.name, e);
            }
            continue;
        }

        // External UDP handler: wait until the socket is readable, hand a
        // duplicate of it to the child as stdin, pause until it exits.
        if let Err(e) = socket.readable().await {
            warn!("inetd {}: {}", conf.name, e);
            continue;
        }

        if !filter_allows(&conf.filters, &iface) {
            let _ = socket.recv_from(&mut buf).await;
            continue;
        }

        let fd = match duplicate_fd(&socket) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("inetd {}: cannot dup socket: {}", conf.name, e);
                continue;
            }
        };

        if tx
            .send(InetdConn {
                key: key.clone(),
                iface: iface.clone(),
                fd,
            })
            .is_err()
        {
            return;
        }

        if resume_rx.recv().await.is_none() {
            return;
        }
    }
}

fn duplicate_fd(socket: &UdpSocket) -> std::io::Result<OwnedFd> {
    use std::os::fd::AsFd;
    socket.as_fd().try_clone_to_owned()
}

async fn handle_builtin_tcp(builtin: Builtin, mut stream: TcpStream) {
    let mut buf = [0u8; 2048];
    match builtin {
        Builtin::Echo => loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        },
        Builtin::Discard => loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        },
        Builtin::Daytime => {
            let _ = stream.write_all(daytime_string().as_bytes()).await;
        }
        Builtin::Time => {
            let _ = stream.write_all(&time_1900().to_be_bytes()).await;
        }
    }
}

/// RFC 868: seconds since 1900-01-01 as a 32-bit integer.
fn time_1900() -> u32 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (now + TIME_1900_OFFSET) as u32
}

/// RFC 867 daytime reply.
fn daytime_string() -> String {
    use time::format_description::well_known::Rfc2822;
    use time::OffsetDateTime;

    let now = OffsetDateTime::now_utc();
    match now.format(&Rfc2822) {
        Ok(s) => format!("{}\r\n", s),
        Err(_) => format!("{}\r\n", now.unix_timestamp()),
    }
}
