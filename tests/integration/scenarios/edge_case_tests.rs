use crate::integration::infrastructure::{assert_status, assert_status_in, SutTestHarness};
use anyhow::Result;
use nix::unistd::AccessFlags;
use serial_test::serial;
use std::time::Duration;
use webprobe::fixtures::{FixtureLock, PermissionGuard, ScratchFile};
use webprobe::http_probe::ProbeRequest;

#[tokio::test]
#[serial]
async fn test_protocol_edges() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("test.conf", &[8080, 8081]).await?;
    let probe = sut.probe()?;
    let send = |request: ProbeRequest| {
        let probe = probe.clone();
        async move { probe.send(request).await.map_err(|e| anyhow::anyhow!("{:?}", e)) }
    };

    let unknown = send(ProbeRequest::new("FOO", "/").map_err(|e| anyhow::anyhow!("{:?}", e))?).await?;
    assert!(unknown.status.as_u16() >= 400, "FOO answered {}", unknown.status);

    let custom = send(ProbeRequest::get("/nonexistent")).await?;
    assert_status(&custom, 404, "GET /nonexistent");
    assert!(custom.text().contains("Custom 404 Page"));

    let too_large = send(ProbeRequest::post("/", "this body is longer than the configured limit")).await?;
    assert_status(&too_large, 413, "POST / over the body limit");

    let second_port = send(ProbeRequest::get("/").on_port(8081)).await?;
    assert_status(&second_port, 200, "GET :8081/");

    let head = send(ProbeRequest::head("/")).await?;
    assert_status(&head, 200, "HEAD /");
    assert!(head.body.is_empty());

    let range = send(ProbeRequest::get("/index.html").header("Range", "bytes=999999-1000000")).await?;
    assert_status_in(&range, &[416, 200, 404], "unsatisfiable range");
    assert!(range.elapsed < Duration::from_secs(2), "range request took {:?}", range.elapsed);

    sut.stop().await
}

#[tokio::test]
#[serial]
async fn test_permission_denied_file() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("test.conf", &[8080, 8081]).await?;
    let probe = sut.probe()?;

    let _lock = FixtureLock::acquire().await;
    let scratch = ScratchFile::create(harness.layout().www_path("perm_denied.txt"), b"secret")
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    let guard = PermissionGuard::apply(scratch.path(), 0o000).map_err(|e| anyhow::anyhow!("{:?}", e))?;
    if !guard.denies(AccessFlags::R_OK) {
        eprintln!("skipping: permission bits are not enforced for this user");
        drop(guard);
        return sut.stop().await;
    }

    let response = probe
        .get("/perm_denied.txt")
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    assert_status_in(&response, &[403, 404, 500], "unreadable file");

    drop(guard);
    drop(scratch);
    sut.stop().await
}

#[tokio::test]
#[serial]
async fn test_read_only_uploads() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let sut = harness.start("test.conf", &[8080, 8081]).await?;
    let probe = sut.probe()?;

    let _lock = FixtureLock::acquire().await;
    let uploads = harness.layout().uploads();
    let _created = ScratchFile::track(uploads.join("perm_upload.txt"));
    let guard = PermissionGuard::apply(&uploads, 0o555).map_err(|e| anyhow::anyhow!("{:?}", e))?;
    if !guard.denies(AccessFlags::W_OK) {
        eprintln!("skipping: permission bits are not enforced for this user");
        drop(guard);
        return sut.stop().await;
    }

    let response = probe
        .put("/uploads/perm_upload.txt", "data")
        .await
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    let status = response.status.as_u16();
    assert!(status != 200 && status != 201, "PUT into read-only dir answered {}", status);

    drop(guard);
    sut.stop().await
}
