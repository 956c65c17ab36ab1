use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{info, warn};
use webprobe::fixtures::FixtureLayout;
use webprobe::http_probe::HttpProbe;
use webprobe::supervisor::{ProcessSupervisor, SutConfig, SutInstance};
use webprobe::timeout_scenarios::{TimeoutPolicy, TimeoutScenarioRunner};

/// Set to `1` to turn a missing server binary into a test failure
const REQUIRE_SUT_VAR: &str = "WEBPROBE_REQUIRE_SUT";

/// Locates the server under test and starts it against the shipped fixtures
pub struct SutTestHarness {
    binary: PathBuf,
    layout: FixtureLayout,
    supervisor: ProcessSupervisor,
    log_dir: TempDir,
    pub readiness_timeout: Duration,
    pub grace: Duration,
}

impl SutTestHarness {
    /// Returns `None` (after logging a skip notice) when no server binary is
    /// configured, unless `WEBPROBE_REQUIRE_SUT=1`.
    pub fn from_env() -> Result<Option<Self>> {
        let explicit = std::env::var_os("WEBPROBE_SUT_BIN")
            .or_else(|| std::env::var_os("WEBSERV_BIN"))
            .map(PathBuf::from);
        let layout = fixture_layout();

        let binary = match ProcessSupervisor::locate_binary(&layout.project_root, explicit.as_deref()) {
            Ok(binary) => binary,
            Err(e) if std::env::var(REQUIRE_SUT_VAR).as_deref() == Ok("1") => {
                bail!("{} is set but no server binary was found: {}", REQUIRE_SUT_VAR, e)
            }
            Err(e) => {
                warn!("skipping: {}", e);
                eprintln!("skipping end-to-end test: set WEBPROBE_SUT_BIN to run it ({})", e);
                return Ok(None);
            }
        };

        layout.prepare().map_err(|e| anyhow::anyhow!("{:?}", e))?;
        Ok(Some(Self {
            binary,
            layout,
            supervisor: ProcessSupervisor::new(Duration::from_millis(200)),
            log_dir: TempDir::new().context("Failed to create log directory")?,
            readiness_timeout: Duration::from_secs(5),
            grace: Duration::from_secs(5),
        }))
    }

    pub fn layout(&self) -> &FixtureLayout {
        &self.layout
    }

    /// Starts the server with `conf` and waits until every port accepts
    pub async fn start(&self, conf: &str, ports: &[u16]) -> Result<RunningSut> {
        let config = SutConfig {
            binary: self.binary.clone(),
            config_path: self.layout.conf_path(conf),
            working_dir: self.layout.project_root.clone(),
            log_path: self.log_dir.path().join(format!("{}.log", conf)),
            ports: ports.to_vec(),
            ..Default::default()
        };
        self.supervisor
            .ensure_released(config.host, ports, Duration::from_secs(2))
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        let mut instance = self
            .supervisor
            .start(&config)
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        let readiness = self
            .supervisor
            .await_ready(&mut instance, ports, self.readiness_timeout)
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        info!("{} ready after {:?}", conf, readiness.waited);

        Ok(RunningSut {
            instance,
            supervisor: self.supervisor.clone(),
            grace: self.grace,
        })
    }
}

/// A started server; stopped explicitly with [`RunningSut::stop`] or
/// killed with its process group on drop
pub struct RunningSut {
    pub instance: SutInstance,
    supervisor: ProcessSupervisor,
    grace: Duration,
}

impl RunningSut {
    pub fn addr(&self) -> SocketAddr {
        self.instance.primary_addr()
    }

    pub fn probe(&self) -> Result<HttpProbe> {
        HttpProbe::new(self.addr(), Duration::from_secs(5)).map_err(|e| anyhow::anyhow!("{:?}", e))
    }

    pub fn runner(&self, policy: TimeoutPolicy) -> TimeoutScenarioRunner {
        TimeoutScenarioRunner::new(self.addr(), policy)
    }

    pub async fn stop(mut self) -> Result<()> {
        self.supervisor
            .stop(&mut self.instance, self.grace)
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))
    }
}

/// `fixtures/` of this crate, used as the server's working directory
pub fn fixture_layout() -> FixtureLayout {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures");
    FixtureLayout::new(root, "conf", "www")
}
