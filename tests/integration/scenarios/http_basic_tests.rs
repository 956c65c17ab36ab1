use crate::integration::infrastructure::{assert_header_contains, assert_status, SutTestHarness};
use anyhow::Result;
use serial_test::serial;

/// Static files, HEAD and autoindex on the default configuration
#[tokio::test]
#[serial]
async fn test_static_files() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("default.conf", &[8080]).await?;
    let probe = sut.probe()?;

    let root = probe.get("/").await.map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&root, 200, "GET /");
    assert!(root.text().to_lowercase().contains("html"));

    let index = probe.get("/index.html").await.map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&index, 200, "GET /index.html");

    let missing = probe.get("/nonexistent.html").await.map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&missing, 404, "GET /nonexistent.html");

    let text = probe.get("/test.txt").await.map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&text, 200, "GET /test.txt");
    assert_header_contains(&text, "content-type", "text/plain");

    sut.stop().await
}

#[tokio::test]
#[serial]
async fn test_head_and_autoindex() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("default.conf", &[8080]).await?;
    let probe = sut.probe()?;

    let head = probe.head("/").await.map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&head, 200, "HEAD /");
    assert!(head.body.is_empty(), "HEAD must not carry a body");
    assert!(head.content_length().unwrap_or(0) > 0, "HEAD should announce the length");

    let listing = probe.get("/autoindex/").await.map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&listing, 200, "GET /autoindex/");
    let body = listing.text().to_lowercase();
    assert!(body.contains("<html"));
    assert!(body.contains("index"));

    sut.stop().await
}
