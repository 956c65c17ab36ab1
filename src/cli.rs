use clap::Parser;
use eyre::eyre;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::fixtures::FixtureLayout;
use crate::suite::SuiteSettings;
use crate::supervisor::ProcessSupervisor;
use crate::timeout_scenarios::{TimeoutPolicy, MIN_SAFETY_MARGIN};

type Result<T> = color_eyre::eyre::Result<T>;

/// Conformance and timeout-resilience harness for an HTTP server binary
#[derive(Parser, Debug)]
#[command(name = "webprobe")]
#[command(about = "Conformance and timeout-resilience harness for an HTTP server binary")]
#[command(version)]
pub struct Cli {
    /// Server binary (default: build/webserv, webserv, bin/webserv, build/bin/webserv)
    #[arg(long, env = "WEBPROBE_SUT_BIN")]
    pub sut_bin: Option<PathBuf>,

    /// Project root; the server's working directory
    #[arg(long, env = "WEBPROBE_ROOT", default_value = ".")]
    pub project_root: PathBuf,

    /// Configuration directory, relative to the project root
    #[arg(long, default_value = "conf")]
    pub conf_dir: PathBuf,

    /// Document root, relative to the project root
    #[arg(long, default_value = "www")]
    pub www_root: PathBuf,

    /// Address the server listens on
    #[arg(long, env = "WEBPROBE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Readiness deadline (ms)
    #[arg(long, default_value = "5000")]
    pub readiness_timeout_ms: u64,

    /// Readiness retry interval (ms)
    #[arg(long, default_value = "200")]
    pub readiness_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL (seconds)
    #[arg(long, default_value = "5")]
    pub grace_secs: u64,

    /// Server idle timeout (seconds)
    #[arg(long, default_value = "10")]
    pub idle_timeout_secs: u64,

    /// Server keep-alive timeout (seconds)
    #[arg(long, default_value = "10")]
    pub keepalive_timeout_secs: u64,

    /// Server CGI execution timeout (seconds)
    #[arg(long, default_value = "10")]
    pub cgi_timeout_secs: u64,

    /// Fraction added to every server timeout before acting on it
    #[arg(long, default_value = "0.5")]
    pub safety_margin: f64,

    /// Stalled peers in the isolation scenario
    #[arg(long, default_value = "3")]
    pub stalled_connections: usize,

    /// Only run these configuration groups (repeatable)
    #[arg(long = "group")]
    pub groups: Vec<String>,

    /// Directory for server log sinks (default: <project-root>/logs)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

/// Validated run configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit server binary, if one was given
    pub sut_bin: Option<PathBuf>,
    pub layout: FixtureLayout,
    pub host: IpAddr,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    pub grace: Duration,
    pub cgi_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    pub groups: Vec<String>,
    pub log_dir: PathBuf,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let host: IpAddr = cli
            .host
            .parse()
            .map_err(|e| eyre!("Invalid host address '{}': {}", cli.host, e))?;

        if cli.safety_margin < MIN_SAFETY_MARGIN {
            return Err(eyre!(
                "--safety-margin {} is below the minimum of {}",
                cli.safety_margin,
                MIN_SAFETY_MARGIN
            ));
        }
        if cli.stalled_connections < 2 {
            return Err(eyre!(
                "--stalled-connections must be at least 2, got {}",
                cli.stalled_connections
            ));
        }
        if cli.readiness_interval_ms == 0 || cli.readiness_timeout_ms == 0 {
            return Err(eyre!("readiness timeout and interval must be non-zero"));
        }

        let timeout_policy = TimeoutPolicy {
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            keepalive_timeout: Duration::from_secs(cli.keepalive_timeout_secs),
            write_timeout: Duration::from_secs(cli.idle_timeout_secs),
            safety_margin: cli.safety_margin,
            stalled_connections: cli.stalled_connections,
            ..Default::default()
        };
        timeout_policy.validate()?;

        let layout = FixtureLayout::new(&cli.project_root, &cli.conf_dir, &cli.www_root);
        let log_dir = cli.log_dir.unwrap_or_else(|| cli.project_root.join("logs"));

        Ok(Config {
            sut_bin: cli.sut_bin,
            layout,
            host,
            readiness_timeout: Duration::from_millis(cli.readiness_timeout_ms),
            readiness_interval: Duration::from_millis(cli.readiness_interval_ms),
            grace: Duration::from_secs(cli.grace_secs),
            cgi_timeout: Duration::from_secs(cli.cgi_timeout_secs),
            timeout_policy,
            groups: cli.groups,
            log_dir,
        })
    }

    /// Resolves the server binary and builds the suite settings
    pub fn suite_settings(&self) -> Result<SuiteSettings> {
        let explicit = self
            .sut_bin
            .clone()
            .or_else(|| std::env::var_os("WEBSERV_BIN").map(PathBuf::from));
        let binary = ProcessSupervisor::locate_binary(&self.layout.project_root, explicit.as_deref())?;

        let mut settings = SuiteSettings::new(binary, self.layout.clone());
        settings.host = self.host;
        settings.readiness_timeout = self.readiness_timeout;
        settings.readiness_interval = self.readiness_interval;
        settings.grace = self.grace;
        settings.cgi_timeout = self.cgi_timeout;
        settings.timeout_policy = self.timeout_policy.clone();
        settings.log_dir = self.log_dir.clone();
        settings.groups = self.groups.clone();
        Ok(settings)
    }
}
