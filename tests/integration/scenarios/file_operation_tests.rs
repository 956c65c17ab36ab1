use crate::integration::infrastructure::{assert_status, SutTestHarness};
use anyhow::Result;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_delete_nonexistent_returns_404() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("test.conf", &[8080, 8081]).await?;
    let response = sut
        .probe()?
        .delete("/uploads/nonexistent.txt")
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status(&response, 404, "DELETE /uploads/nonexistent.txt");

    sut.stop().await
}
