//! Restart-storm scenario: a crash-looping service must end up blocked
//! once it exhausts its restart cap, and an operator start over the
//! control socket recovers it.

use std::time::Duration;

use crate::integration::infrastructure::{api_client, InitHarness};

/// Exits immediately for its first runs, counted through a state file,
/// then settles into a long-running loop. With `restart:3` the early
/// exits trip the storm detector; after recovery the service stays up.
const CRASHY_SCRIPT: &str = "#!/bin/sh\n\
trap '' HUP\n\
count_file=\"$1\"\n\
n=$(cat \"$count_file\" 2>/dev/null || echo 0)\n\
n=$((n + 1))\n\
echo \"$n\" > \"$count_file\"\n\
if [ \"$n\" -le 3 ]; then\n\
    exit 1\n\
fi\n\
while :; do sleep 1; done\n";

#[tokio::test]
async fn test_restart_storm_blocks_and_manual_start_recovers() -> anyhow::Result<()> {
    let mut harness = InitHarness::new()?;
    let script = harness.write_script("crash.sh", CRASHY_SCRIPT)?;
    let counter = harness.run_dir().join("crash.count");

    harness.write_conf(&format!(
        "runlevel 2\nservice [2345] restart:3 {} {} -- crash loop\n",
        script.display(),
        counter.display()
    ))?;
    harness.start().await?;

    // Three quick exits inside the window must block the record; the
    // intermediate crashes sit out their backoff first, so allow for it.
    let blocked = api_client::wait_for(
        &harness.socket(),
        "crash.sh",
        Duration::from_secs(30),
        |s| s.state_str() == "blocked",
    )
    .await?;
    assert_eq!(blocked.pid, 0);
    assert!(blocked.crashes >= 3);

    // Blocked means blocked: no respawn without operator intervention.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let still = api_client::find(&harness.socket(), "crash.sh")
        .await?
        .expect("record still registered");
    assert_eq!(still.state_str(), "blocked");

    // An explicit start resets the restart history and brings it back;
    // by now the script has used up its crashing runs and stays up.
    assert!(api_client::start(&harness.socket(), "crash.sh").await?);
    let running = api_client::wait_for(
        &harness.socket(),
        "crash.sh",
        Duration::from_secs(5),
        |s| s.state_str() == "running" && s.pid > 0,
    )
    .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let after = api_client::find(&harness.socket(), "crash.sh")
        .await?
        .expect("record still registered");
    assert_eq!(after.state_str(), "running");
    assert_eq!(after.pid, running.pid);

    harness.shutdown().await?;
    Ok(())
}
