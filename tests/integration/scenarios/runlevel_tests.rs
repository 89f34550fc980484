//! Runlevel governor scenarios: mass stop/start on transition, overlap
//! keeps its process, and same-level requests are no-ops.

use std::time::Duration;

use crate::integration::infrastructure::{api_client, InitHarness};

const DAEMON_SCRIPT: &str = "#!/bin/sh\ntrap '' HUP\nwhile :; do sleep 1; done\n";

#[tokio::test]
async fn test_runlevel_change_stops_starts_and_keeps_overlap() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let s2 = harness.write_script("s2.sh", DAEMON_SCRIPT)?;
    let s3 = harness.write_script("s3.sh", DAEMON_SCRIPT)?;
    let sb = harness.write_script("sb.sh", DAEMON_SCRIPT)?;

    harness.write_conf(&format!(
        "runlevel 2\n\
         service [2] {} -- only level two\n\
         service [3] {} -- only level three\n\
         service [23] {} -- both levels\n",
        s2.display(),
        s3.display(),
        sb.display()
    ))?;
    harness.start().await?;

    api_client::wait_for(&harness.socket(), "s2.sh", Duration::from_secs(2), |s| {
        s.state_str() == "running"
    })
    .await?;
    let sb_before = api_client::wait_for(
        &harness.socket(),
        "sb.sh",
        Duration::from_secs(2),
        |s| s.state_str() == "running",
    )
    .await?;
    let s3_idle = api_client::find(&harness.socket(), "s3.sh").await?.unwrap();
    assert_eq!(s3_idle.state_str(), "halted");

    // Level 3: S2 out, S3 in, Sb untouched.
    assert!(api_client::set_runlevel(&harness.socket(), '3').await?);

    api_client::wait_for(&harness.socket(), "s2.sh", Duration::from_secs(8), |s| {
        s.state_str() == "halted"
    })
    .await?;
    api_client::wait_for(&harness.socket(), "s3.sh", Duration::from_secs(8), |s| {
        s.state_str() == "running"
    })
    .await?;

    let sb_after = api_client::find(&harness.socket(), "sb.sh").await?.unwrap();
    assert_eq!(sb_after.state_str(), "running");
    assert_eq!(
        sb_after.pid, sb_before.pid,
        "overlapping service must keep its process across the transition"
    );

    let (level, prev) = api_client::get_runlevel(&harness.socket()).await?;
    assert_eq!(level, 3);
    assert_eq!(prev, 2);

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_same_level_request_is_noop() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let script = harness.write_script("svc.sh", DAEMON_SCRIPT)?;

    harness.write_conf(&format!(
        "runlevel 2\nservice [2] {} -- steady\n",
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

    assert!(api_client::set_runlevel(&harness.socket(), '2').await?);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = api_client::find(&harness.socket(), "svc.sh").await?.unwrap();
    assert_eq!(after.pid, before.pid);
    let (level, _) = api_client::get_runlevel(&harness.socket()).await?;
    assert_eq!(level, 2);

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_single_user_alias() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let script = harness.write_script("svc.sh", DAEMON_SCRIPT)?;

    harness.write_conf(&format!(
        "runlevel 2\nservice [S] {} -- single user only\n",
        script.display()
    ))?;
    harness.start().await?;

    // [S] means level 1; nothing runs at level 2.
    let idle = api_client::find(&harness.socket(), "svc.sh").await?.unwrap();
    assert_eq!(idle.state_str(), "halted");

    assert!(api_client::set_runlevel(&harness.socket(), 'S').await?);
    api_client::wait_for(&harness.socket(), "svc.sh", Duration::from_secs(8), |s| {
        s.state_str() == "running"
    })
    .await?;

    let (level, _) = api_client::get_runlevel(&harness.socket()).await?;
    assert_eq!(level, 1);

    harness.shutdown().await?;
    Ok(())
}
