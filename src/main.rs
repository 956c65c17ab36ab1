use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use webprobe::cli::{Cli, Config};
use webprobe::report::{SuiteReport, EXIT_FATAL, EXIT_INTERRUPTED};
use webprobe::signals::cancel_on_signal;
use webprobe::suite::{RunOutcome, ScenarioSuite};
use webprobe::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webprobe=info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    info!("webprobe starting in {}", config.layout.project_root.display());

    let mut report = SuiteReport::new();
    let settings = match config.suite_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            report.record_fatal(e.to_string());
            println!("{}", report);
            std::process::exit(EXIT_FATAL);
        }
    };
    info!("Server binary: {}", settings.binary.display());

    let suite = match ScenarioSuite::new(settings) {
        Ok(suite) => suite,
        Err(e) => {
            error!("{}", e);
            report.record_fatal(e.to_string());
            println!("{}", report);
            std::process::exit(EXIT_FATAL);
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let outcome = suite.run(&mut report, &cancel).await;
    cancel.cancel();

    println!("{}", report);
    let code = match outcome {
        RunOutcome::Interrupted => {
            info!("run {} interrupted", report.run_id);
            EXIT_INTERRUPTED
        }
        RunOutcome::Completed => report.exit_code(),
    };
    info!("webprobe exiting with {}", code);
    std::process::exit(code);
}
