use crate::integration::infrastructure::SutTestHarness;
use anyhow::Result;
use serial_test::serial;
use webprobe::raw_socket::StallFate;
use webprobe::timeout_scenarios::{RequestShape, Scenario, TimeoutPolicy};

async fn run_scenario(build: impl FnOnce(&TimeoutPolicy) -> Scenario) -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("default.conf", &[8080]).await?;
    let policy = TimeoutPolicy::default();
    let scenario = build(&policy);
    let observation = sut
        .runner(policy)
        .run_and_check(&scenario)
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;

    // Either fate is acceptable for the stalled socket itself
    for fate in &observation.fates {
        assert!(matches!(fate, StallFate::PeerClosed | StallFate::LeftOpen { .. }));
    }
    sut.stop().await
}

#[tokio::test]
#[serial]
async fn test_incomplete_request_timeout() -> Result<()> {
    run_scenario(|policy| Scenario::idle_read(policy, RequestShape::MissingBlankLine)).await
}

#[tokio::test]
#[serial]
async fn test_slow_client_write_stall() -> Result<()> {
    run_scenario(|policy| Scenario::slow_client_write(policy, "/test.txt")).await
}

#[tokio::test]
#[serial]
async fn test_multiple_connections_isolation() -> Result<()> {
    run_scenario(Scenario::isolation).await
}

#[tokio::test]
#[serial]
async fn test_new_connection_after_timeout() -> Result<()> {
    run_scenario(Scenario::post_timeout_admission).await
}

#[tokio::test]
#[serial]
async fn test_keepalive_idle_timeout() -> Result<()> {
    run_scenario(Scenario::keepalive_idle).await
}

#[tokio::test]
#[serial]
async fn test_large_body_stall() -> Result<()> {
    run_scenario(Scenario::large_body_stall).await
}
