//! Condition engine scenarios: services gated on other services and on
//! operator-emitted facts.

use std::time::Duration;

use crate::integration::infrastructure::{api_client, InitHarness};

const DAEMON_SCRIPT: &str = "#!/bin/sh\ntrap '' HUP\nwhile :; do sleep 1; done\n";

#[tokio::test]
async fn test_service_gated_on_service() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let a = harness.write_script("a.sh", DAEMON_SCRIPT)?;
    let b = harness.write_script("b.sh", DAEMON_SCRIPT)?;

    // A only starts on request; B depends on A's condition fact.
    harness.write_conf(&format!(
        "runlevel 2\n\
         service [2] manual:yes {a} -- service A\n\
         service [2] <svc/{a}> {b} -- service B\n",
        a = a.display(),
        b = b.display()
    ))?;
    harness.start().await?;

    let snap = api_client::wait_for(
        &harness.socket(),
        "b.sh",
        Duration::from_secs(2),
        |s| s.state_str() == "waiting",
    )
    .await?;
    assert_eq!(snap.pid, 0);

    // Starting A satisfies B's start condition.
    assert!(api_client::start(&harness.socket(), "a.sh").await?);
    api_client::wait_for(&harness.socket(), "a.sh", Duration::from_secs(2), |s| {
        s.state_str() == "running"
    })
    .await?;
    api_client::wait_for(&harness.socket(), "b.sh", Duration::from_secs(2), |s| {
        s.state_str() == "running"
    })
    .await?;

    // Stopping A retracts the fact; B must leave RUNNING again.
    assert!(api_client::stop(&harness.socket(), "a.sh").await?);
    api_client::wait_for(&harness.socket(), "b.sh", Duration::from_secs(5), |s| {
        s.state_str() == "waiting"
    })
    .await?;

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_emitted_fact_gates_service() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let script = harness.write_script("svc.sh", DAEMON_SCRIPT)?;

    harness.write_conf(&format!(
        "runlevel 2\nservice [2] <usr/ready> {} -- gated\n",
        script.display()
    ))?;
    harness.start().await?;

    api_client::wait_for(&harness.socket(), "svc.sh", Duration::from_secs(2), |s| {
        s.state_str() == "waiting"
    })
    .await?;

    api_client::emit(&harness.socket(), "+usr/ready").await?;
    api_client::wait_for(&harness.socket(), "svc.sh", Duration::from_secs(2), |s| {
        s.state_str() == "running"
    })
    .await?;
    assert!(harness.cond_file("usr/ready").exists());

    // Retracting the fact stops the service and leaves the store in its
    // pre-emit state.
    api_client::emit(&harness.socket(), "-usr/ready").await?;
    api_client::wait_for(&harness.socket(), "svc.sh", Duration::from_secs(5), |s| {
        s.state_str() == "waiting"
    })
    .await?;
    assert!(!harness.cond_file("usr/ready").exists());

    harness.shutdown().await?;
    Ok(())
}
