//! Reload scenarios: dynamic add/remove of services and reload without
//! restart for SIGHUP-capable daemons.

use std::time::Duration;

use crate::integration::infrastructure::{api_client, InitHarness};

/// A daemon that survives reconfiguration signals.
const DAEMON_SCRIPT: &str = "#!/bin/sh\ntrap '' HUP\nwhile :; do sleep 1; done\n";

#[tokio::test]
async fn test_dynamic_add() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let script = harness.write_script("svc.sh", DAEMON_SCRIPT)?;

    harness.write_conf("runlevel 2\n")?;
    harness.start().await?;

    assert!(api_client::find(&harness.socket(), "svc.sh").await?.is_none());

    // Add the service on disk, then ask for a reload.
    harness.write_conf(&format!(
        "runlevel 2\nservice [2345] {} -- test service\n",
        script.display()
    ))?;
    harness.sighup()?;

    let snap = api_client::wait_for(
        &harness.socket(),
        "svc.sh",
        Duration::from_secs(2),
        |s| s.state_str() == "running" && s.pid > 0,
    )
    .await?;
    assert_eq!(snap.desc, "test service");

    // The running service asserts its condition fact on disk.
    let fact = format!("svc/{}", script.display());
    assert!(harness.cond_file(&fact).exists());

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_dynamic_remove() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let script = harness.write_script("svc.sh", DAEMON_SCRIPT)?;

    harness.write_conf(&format!(
        "runlevel 2\nservice [2345] {} -- test service\n",
        script.display()
    ))?;
    harness.start().await?;

    api_client::wait_for(
        &harness.socket(),
        "svc.sh",
        Duration::from_secs(2),
        |s| s.state_str() == "running",
    )
    .await?;

    // Remove it from the configuration; the record must stop and vanish.
    harness.write_conf("runlevel 2\n")?;
    harness.sighup()?;

    api_client::wait_gone(&harness.socket(), "svc.sh", Duration::from_secs(5)).await?;
    let fact = format!("svc/{}", script.display());
    assert!(!harness.cond_file(&fact).exists());

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_reload_without_restart() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let script = harness.write_script("svc.sh", DAEMON_SCRIPT)?;

    harness.write_conf(&format!(
        "runlevel 2\nservice [2345] {} -- first\n",
        script.display()
    ))?;
    harness.start().await?;

    let before = api_client::wait_for(
        &harness.socket(),
        "svc.sh",
        Duration::from_secs(2),
        |s| s.state_str() == "running",
    )
    .await?;

    // Only the description changes; the daemon accepts SIGHUP, so the
    // PID must survive the reload and the changed flag must clear.
    harness.write_conf(&format!(
        "runlevel 2\nservice [2345] {} -- second\n",
        script.display()
    ))?;
    harness.sighup()?;

    let after = api_client::wait_for(
        &harness.socket(),
        "svc.sh",
        Duration::from_secs(3),
        |s| s.desc == "second",
    )
    .await?;
    assert_eq!(after.pid, before.pid, "reload must not restart the daemon");
    assert_eq!(after.flags & rinit::api::snapshot_flags::CHANGED, 0);
    assert_eq!(after.state_str(), "running");

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_start_on_running_is_ack_noop() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let script = harness.write_script("svc.sh", DAEMON_SCRIPT)?;

    harness.write_conf(&format!(
        "runlevel 2\nservice [2345] {} -- test service\n",
        script.display()
    ))?;
    harness.start().await?;

    let before = api_client::wait_for(
        &harness.socket(),
        "svc.sh",
        Duration::from_secs(2),
        |s| s.state_str() == "running",
    )
    .await?;

    assert!(api_client::start(&harness.socket(), "svc.sh").await?);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = api_client::find(&harness.socket(), "svc.sh")
        .await?
        .expect("service still registered");
    assert_eq!(after.pid, before.pid);
    assert_eq!(after.state_str(), "running");

    // Unknown names are NACKed.
    assert!(!api_client::start(&harness.socket(), "nonsuch").await?);

    harness.shutdown().await?;
    Ok(())
}
