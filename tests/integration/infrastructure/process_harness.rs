use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};

/// Spawns the supervisor binary in a private sandbox: its own config
/// file, drop-in dir, run dir and control socket under a tempdir, so the
/// tests never touch the host system.
pub struct InitHarness {
    temp: TempDir,
    child: Option<Child>,
    pub pid: Option<Pid>,
}

impl InitHarness {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new().context("cannot create sandbox dir")?;
        std::fs::create_dir_all(temp.path().join("rinit.d"))?;
        std::fs::create_dir_all(temp.path().join("dev"))?;

        Ok(Self {
            temp,
            child: None,
            pid: None,
        })
    }

    pub fn conf_path(&self) -> PathBuf {
        self.temp.path().join("rinit.conf")
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.temp.path().join("rinit.d")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.temp.path().join("run")
    }

    pub fn socket(&self) -> PathBuf {
        self.run_dir().join("socket")
    }

    pub fn write_conf(&self, content: &str) -> Result<()> {
        std::fs::write(self.conf_path(), content)?;
        Ok(())
    }

    /// Drop an executable helper script into the sandbox and return its
    /// absolute path, for use as a service command.
    pub fn write_script(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.temp.path().join(name);
        std::fs::write(&path, content)?;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
        Ok(path)
    }

    /// Condition fact file path under the sandbox run dir.
    pub fn cond_file(&self, fact: &str) -> PathBuf {
        self.run_dir().join("cond").join(fact)
    }

    /// Spawn the supervisor and wait until its control socket answers.
    pub async fn start(&mut self) -> Result<()> {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_rinit"));
        cmd.arg("--config")
            .arg(self.conf_path())
            .arg("--config-dir")
            .arg(self.conf_dir())
            .arg("--run-dir")
            .arg(self.run_dir())
            .arg("--dev-dir")
            .arg(self.temp.path().join("dev"))
            .arg("--stop-grace-secs")
            .arg("2")
            .arg("--kill-delay-secs")
            .arg("1")
            .arg("--reap-interval-ms")
            .arg("200")
            .env("RUST_LOG", "debug")
            .kill_on_drop(true);

        let child = cmd.spawn().context("cannot spawn supervisor binary")?;
        let pid = child
            .id()
            .map(|id| Pid::from_raw(id as i32))
            .context("no pid for supervisor")?;

        self.child = Some(child);
        self.pid = Some(pid);

        self.wait_for_socket(Duration::from_secs(5)).await
    }

    async fn wait_for_socket(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let socket = self.socket();
        loop {
            if tokio::net::UnixStream::connect(&socket).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("supervisor socket never came up");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// SIGHUP to the supervisor is equivalent to an API reload request.
    pub fn sighup(&self) -> Result<()> {
        let pid = self.pid.context("supervisor not running")?;
        kill(pid, Signal::SIGHUP)?;
        Ok(())
    }

    /// Graceful teardown: SIGTERM, wait for a clean exit.
    pub async fn shutdown(mut self) -> Result<()> {
        let pid = self.pid.context("supervisor not running")?;
        kill(pid, Signal::SIGTERM)?;

        if let Some(mut child) = self.child.take() {
            let status =
                tokio::time::timeout(Duration::from_secs(10), child.wait()).await??;
            anyhow::ensure!(status.success(), "supervisor exited with {}", status);
        }
        self.pid = None;
        Ok(())
    }
}

impl Drop for InitHarness {
    fn drop(&mut self) {
        // kill_on_drop handles the supervisor; its children are in their
        // own sessions, reap what we can without blocking.
        if let Some(pid) = self.pid {
            let _ = kill(pid, Signal::SIGKILL);
        }
    }
}
