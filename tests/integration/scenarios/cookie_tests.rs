use crate::integration::infrastructure::{assert_header_contains, assert_status, SutTestHarness};
use anyhow::Result;
use serial_test::serial;
use webprobe::http_probe::ProbeRequest;

#[tokio::test]
#[serial]
async fn test_cookie_round_trip() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("cgi.conf", &[8080]).await?;
    let probe = sut.probe()?;

    let set = probe
        .get("/cgi-bin/setcookie.sh")
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_header_contains(&set, "set-cookie", "sess=abc123");

    // Replay exactly the name=value pair the server handed out
    let cookie = set
        .header_all("set-cookie")
        .iter()
        .find_map(|v| v.split(';').next().filter(|pair| pair.starts_with("sess=")))
        .map(str::to_string)
        .unwrap_or_default();
    let echoed = probe
        .send(ProbeRequest::get("/cgi-bin/echo_cookie.sh").header("Cookie", cookie.as_str()))
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&echoed, 200, "echo_cookie");
    assert_eq!(echoed.text().trim(), cookie);

    sut.stop().await
}
