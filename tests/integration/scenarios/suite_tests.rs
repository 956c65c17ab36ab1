use crate::integration::infrastructure::{fixture_layout, SutTestHarness};
use anyhow::Result;
use serial_test::serial;
use tokio_util::sync::CancellationToken;
use webprobe::report::{SuiteReport, EXIT_PASSED};
use webprobe::suite::{RunOutcome, ScenarioSuite, SuiteSettings};
use webprobe::supervisor::ProcessSupervisor;

/// Runs the catalogue's quick groups through the same path as the CLI
#[tokio::test]
#[serial]
async fn test_quick_groups_pass() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let Some(_harness) = SutTestHarness::from_env()? else { return Ok(()) };

    let layout = fixture_layout();
    let explicit = std::env::var_os("WEBPROBE_SUT_BIN")
        .or_else(|| std::env::var_os("WEBSERV_BIN"))
        .map(std::path::PathBuf::from);
    let binary = ProcessSupervisor::locate_binary(&layout.project_root, explicit.as_deref())?;

    let log_dir = tempfile::TempDir::new()?;
    let mut settings = SuiteSettings::new(binary, layout);
    settings.log_dir = log_dir.path().to_path_buf();
    settings.groups = vec!["cgi".to_string()];

    let mut report = SuiteReport::new();
    let outcome = ScenarioSuite::new(settings)
        .map_err(|e| anyhow::anyhow!("{:?}", e))?
        .run(&mut report, &CancellationToken::new())
        .await;

    println!("{}", report);
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(report.exit_code(), EXIT_PASSED, "{}", report);
    Ok(())
}
