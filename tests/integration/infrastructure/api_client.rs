//! Thin wire-protocol client used by the scenarios; one request per
//! connection, exactly like the external control tool.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use rinit::api::{self, cmd, Request, SvcSnapshot, SNAPSHOT_LEN};

pub async fn get_runlevel(socket: &Path) -> Result<(u8, u8)> {
    let reply = api::send_request(socket, &Request::new(cmd::GET_RUNLEVEL)).await?;
    anyhow::ensure!(reply.cmd == cmd::ACK, "runlevel query NACKed");
    Ok((reply.runlevel as u8, reply.sleeptime as u8))
}

pub async fn reload(socket: &Path) -> Result<()> {
    let reply = api::send_request(socket, &Request::new(cmd::RELOAD)).await?;
    anyhow::ensure!(reply.cmd == cmd::ACK, "reload NACKed");
    Ok(())
}

/// Returns true on ACK, false on NACK.
pub async fn start(socket: &Path, jobstr: &str) -> Result<bool> {
    let reply = api::send_request(socket, &Request::with_data(cmd::START, jobstr)).await?;
    Ok(reply.cmd == cmd::ACK)
}

pub async fn stop(socket: &Path, jobstr: &str) -> Result<bool> {
    let reply = api::send_request(socket, &Request::with_data(cmd::STOP, jobstr)).await?;
    Ok(reply.cmd == cmd::ACK)
}

pub async fn emit(socket: &Path, events: &str) -> Result<()> {
    let reply = api::send_request(socket, &Request::with_data(cmd::EMIT, events)).await?;
    anyhow::ensure!(reply.cmd == cmd::ACK, "emit NACKed");
    Ok(())
}

pub async fn set_runlevel(socket: &Path, level: char) -> Result<bool> {
    let mut rq = Request::new(cmd::RUNLVL);
    rq.runlevel = level as i32;
    let reply = api::send_request(socket, &rq).await?;
    Ok(reply.cmd == cmd::ACK)
}

/// Find one record; None when the supervisor reports no match.
pub async fn find(socket: &Path, jobstr: &str) -> Result<Option<SvcSnapshot>> {
    let mut stream = UnixStream::connect(socket)
        .await
        .context("cannot connect to control socket")?;
    stream
        .write_all(&Request::with_data(cmd::SVC_FIND, jobstr).encode())
        .await?;

    let mut buf = [0u8; SNAPSHOT_LEN];
    stream.read_exact(&mut buf).await?;
    let snap = SvcSnapshot::decode(&buf).context("bad snapshot frame")?;
    Ok(if snap.is_empty() { None } else { Some(snap) })
}

pub async fn list(socket: &Path) -> Result<Vec<SvcSnapshot>> {
    Ok(api::enumerate(socket).await?)
}

/// Poll until the record matches the predicate or the timeout expires.
pub async fn wait_for<F>(
    socket: &Path,
    jobstr: &str,
    timeout: Duration,
    pred: F,
) -> Result<SvcSnapshot>
where
    F: Fn(&SvcSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(snap) = find(socket, jobstr).await? {
            if pred(&snap) {
                return Ok(snap);
            }
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {}", jobstr);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Poll until the record disappears from the registry.
pub async fn wait_gone(socket: &Path, jobstr: &str, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if find(socket, jobstr).await?.is_none() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("{} never went away", jobstr);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
