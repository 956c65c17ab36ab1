use crate::integration::infrastructure::{assert_elapsed_within, assert_status, SutTestHarness};
use anyhow::Result;
use reqwest::StatusCode;
use serial_test::serial;
use std::time::Duration;
use webprobe::cgi_gateway::CgiGatewayProbe;
use webprobe::http_probe::ProbeRequest;

#[tokio::test]
#[serial]
async fn test_cgi_execution() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("cgi.conf", &[8080]).await?;
    let probe = sut.probe()?;

    for script in ["/cgi-bin/basic.sh", "/cgi-bin/simple.sh"] {
        let response = probe.get(script).await.map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert_status(&response, 200, script);
        assert!(!response.body.is_empty(), "{} produced no body", script);
    }

    let posted = probe
        .send(
            ProbeRequest::post("/cgi-bin/post_test.sh", "name=webprobe&value=42")
                .header("Content-Type", "application/x-www-form-urlencoded"),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&posted, 200, "POST post_test.sh");
    assert!(posted.text().contains("body=name=webprobe&value=42"));

    let env = probe
        .get("/cgi-bin/env_dump.sh?probe=1")
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&env, 200, "env_dump.sh");
    assert!(env.text().contains("REQUEST_METHOD=GET"));
    assert!(env.text().contains("QUERY_STRING=probe=1"));

    sut.stop().await
}

/// The hanging script must be cut off by the server within its CGI bound
#[tokio::test]
#[serial]
async fn test_gateway_timeout_window() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("complete.conf", &[8080]).await?;
    let gateway = CgiGatewayProbe::new(sut.probe()?, Duration::from_secs(10));
    let (min, max) = gateway.expected_window();

    let result = gateway
        .measure("/cgi-bin/infinite.sh", StatusCode::GATEWAY_TIMEOUT, min, max)
        .await;
    assert_eq!(result.status, Some(StatusCode::GATEWAY_TIMEOUT), "{:?}", result.failure());
    assert_elapsed_within(result.elapsed, Duration::from_millis(9500), Duration::from_secs(15), "gateway timeout");

    sut.stop().await
}

#[tokio::test]
#[serial]
async fn test_abandoned_cgi_does_not_crash() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("test.conf", &[8080, 8081]).await?;
    let gateway = CgiGatewayProbe::new(sut.probe()?, Duration::from_secs(10));
    gateway
        .client_abandon("/cgi-bin/hang.cgi", Duration::from_secs(2))
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;

    sut.stop().await
}
