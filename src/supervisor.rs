use super::Result;
use crate::errors::HarnessError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpgid, Pid};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Candidate locations of the server binary, relative to the project root
const BINARY_CANDIDATES: [&str; 4] = ["build/webserv", "webserv", "bin/webserv", "build/bin/webserv"];

/// How much of the log sink is attached to setup-failure errors
const CAPTURED_OUTPUT_LIMIT: u64 = 64 * 1024;

/// How long to wait for the group to vanish after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Launch parameters of one server instance
#[derive(Debug, Clone)]
pub struct SutConfig {
    /// Server executable
    pub binary: PathBuf,
    /// Configuration file passed as the only argument
    pub config_path: PathBuf,
    /// Working directory; config files reference fixtures relative to it
    pub working_dir: PathBuf,
    /// File receiving the server's stdout and stderr
    pub log_path: PathBuf,
    /// Host the server's listeners are probed on
    pub host: IpAddr,
    /// Ports declared in the configuration file
    pub ports: Vec<u16>,
    /// Extra environment variables for the server process
    pub environment: HashMap<String, String>,
}

impl Default for SutConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("webserv"),
            config_path: PathBuf::from("conf/default.conf"),
            working_dir: PathBuf::from("."),
            log_path: PathBuf::from("webserv.log"),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: vec![8080],
            environment: HashMap::new(),
        }
    }
}

/// Lifecycle state of a [`SutInstance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Spawned, readiness not yet confirmed
    Starting,
    /// Every declared port accepted a connection
    Ready,
    /// Process group terminated and reaped
    Stopped,
}

/// Outcome of a readiness wait
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub ready: bool,
    pub waited: Duration,
    pub attempts: u32,
}

/// One running server process.
///
/// Owned by whoever called [`ProcessSupervisor::start`]. Dropping a live
/// instance kills its whole process group so a panicking test can never
/// leak a listener onto the shared ports.
#[derive(Debug)]
pub struct SutInstance {
    pub pid: Pid,
    pub pgid: Pid,
    pub host: IpAddr,
    pub ports: Vec<u16>,
    pub config_path: PathBuf,
    pub start_time: Instant,
    log_path: PathBuf,
    child: Option<Child>,
    state: InstanceState,
    exit_status: Option<ExitStatus>,
}

impl SutInstance {
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Address of the first declared port
    pub fn primary_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.ports.first().copied().unwrap_or(80))
    }

    pub fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.host, port)
    }

    /// `http://host:port` of the first declared port
    pub fn base_url(&self) -> String {
        format!("http://{}", self.primary_addr())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Returns the tail of everything the server wrote to stdout/stderr
    pub fn captured_output(&self) -> String {
        read_tail(&self.log_path, CAPTURED_OUTPUT_LIMIT)
            .unwrap_or_else(|e| format!("<log sink {} unreadable: {}>", self.log_path.display(), e))
    }

    /// Reaps the process if it already exited, without blocking
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.exit_status = Some(status);
                }
            }
        }
        self.exit_status
    }

    /// Whether the direct child is still running
    pub fn is_running(&mut self) -> bool {
        self.child.is_some() && self.try_exit_status().is_none()
    }

    /// Whether any member of the process group is still alive
    pub fn group_alive(&self) -> bool {
        group_alive(self.pgid)
    }
}

impl Drop for SutInstance {
    fn drop(&mut self) {
        if self.state == InstanceState::Stopped {
            return;
        }
        if group_alive(self.pgid) {
            eprintln!(
                "SutInstance dropped while live (PGID: {}), sending SIGKILL to the group",
                self.pgid
            );
            if let Err(e) = kill(Pid::from_raw(-self.pgid.as_raw()), Signal::SIGKILL) {
                if e != nix::Error::ESRCH {
                    eprintln!("Failed to SIGKILL process group {}: {}", self.pgid, e);
                }
            }
        }
    }
}

/// Starts, probes and tears down server processes.
///
/// Every server runs in its own process group so that teardown reaches
/// CGI subprocesses as well as the server itself.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    /// Pause between readiness rounds
    pub retry_interval: Duration,
    /// Upper bound of a single connect attempt during readiness polling
    pub connect_timeout: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(500),
        }
    }
}

impl ProcessSupervisor {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            ..Default::default()
        }
    }

    /// Finds the server executable.
    ///
    /// An explicit path wins; otherwise the conventional build locations
    /// under `project_root` are tried in order.
    ///
    /// # Arguments
    /// * `project_root` - Root the candidate locations are relative to
    /// * `explicit` - Path given on the command line or via the environment
    ///
    /// # Returns
    /// * `Result<PathBuf, HarnessError>` - First executable candidate
    pub fn locate_binary(project_root: &Path, explicit: Option<&Path>) -> std::result::Result<PathBuf, HarnessError> {
        let mut tried = Vec::new();
        if let Some(path) = explicit {
            if is_executable(path) {
                return Ok(path.to_path_buf());
            }
            tried.push(path.to_path_buf());
        }
        for candidate in BINARY_CANDIDATES {
            let path = project_root.join(candidate);
            if is_executable(&path) {
                return Ok(path);
            }
            tried.push(path);
        }
        Err(HarnessError::BinaryNotFound { tried })
    }

    /// Spawns the server in a new process group and returns immediately.
    ///
    /// # Arguments
    /// * `config` - Launch parameters
    ///
    /// # Returns
    /// * `Result<SutInstance>` - Handle to the starting process
    pub fn start(&self, config: &SutConfig) -> Result<SutInstance> {
        if let Some(parent) = config.log_path.parent() {
            fs::create_dir_all(parent).map_err(|source| HarnessError::Fixture {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let sink = File::create(&config.log_path).map_err(|source| HarnessError::Fixture {
            path: config.log_path.clone(),
            source,
        })?;
        let sink_err = sink.try_clone()?;

        info!(
            "Spawning {} {} (cwd {})",
            config.binary.display(),
            config.config_path.display(),
            config.working_dir.display()
        );

        let mut command = Command::new(&config.binary);
        command.arg(&config.config_path);
        command.current_dir(&config.working_dir);
        command.envs(&config.environment);
        // process_group(0) makes the server the leader of a fresh group
        command.process_group(0);
        command.stdin(Stdio::null());
        command.stdout(Stdio::from(sink));
        command.stderr(Stdio::from(sink_err));

        let child = command.spawn().map_err(|source| HarnessError::SpawnFailed {
            binary: config.binary.clone(),
            source,
        })?;

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre::eyre!("Failed to get process ID of {}", config.binary.display())),
        };
        let pgid = getpgid(Some(pid)).unwrap_or(pid);

        info!("Server spawned with PID {} (PGID {})", pid, pgid);

        Ok(SutInstance {
            pid,
            pgid,
            host: config.host,
            ports: config.ports.clone(),
            config_path: config.config_path.clone(),
            start_time: Instant::now(),
            log_path: config.log_path.clone(),
            child: Some(child),
            state: InstanceState::Starting,
            exit_status: None,
        })
    }

    /// Polls every declared port until each accepted one connection.
    ///
    /// Each round makes a short connect-and-close attempt per pending port
    /// and then sleeps `retry_interval`. A process that dies while we wait
    /// fails fast with its captured output.
    ///
    /// # Arguments
    /// * `instance` - Instance returned by [`ProcessSupervisor::start`]
    /// * `ports` - Ports that must accept connections
    /// * `deadline` - Overall readiness deadline
    ///
    /// # Returns
    /// * `Result<Readiness>` - Readiness report, or a fatal setup error
    pub async fn await_ready(&self, instance: &mut SutInstance, ports: &[u16], deadline: Duration) -> Result<Readiness> {
        let started = Instant::now();
        let mut pending: Vec<u16> = ports.to_vec();
        let mut attempts = 0u32;

        loop {
            if let Some(status) = instance.try_exit_status() {
                instance.state = InstanceState::Stopped;
                return Err(HarnessError::ExitedBeforeReady {
                    status,
                    output: instance.captured_output(),
                }
                .into());
            }

            let mut still_pending = Vec::with_capacity(pending.len());
            for port in pending {
                attempts += 1;
                if self.connect_once(instance.addr(port)).await {
                    debug!("Port {} accepting after {:?}", port, started.elapsed());
                } else {
                    still_pending.push(port);
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                let waited = started.elapsed();
                instance.state = InstanceState::Ready;
                info!("Server ready on {:?} after {:?} ({} attempts)", ports, waited, attempts);
                return Ok(Readiness {
                    ready: true,
                    waited,
                    attempts,
                });
            }

            if started.elapsed() >= deadline {
                warn!("Readiness deadline {:?} reached, still waiting on {:?}", deadline, pending);
                return Err(HarnessError::NotReady {
                    ports: pending,
                    waited: started.elapsed(),
                    output: instance.captured_output(),
                }
                .into());
            }

            sleep(self.retry_interval).await;
        }
    }

    /// Terminates the whole process group.
    ///
    /// SIGTERM goes to the group first; anything still alive after `grace`
    /// receives SIGKILL. A group that survives SIGKILL is a fatal error
    /// because it would keep the shared ports bound.
    ///
    /// # Arguments
    /// * `instance` - Instance to stop
    /// * `grace` - Time allowed for a clean exit after SIGTERM
    ///
    /// # Returns
    /// * `Result<()>` - Success or [`HarnessError::TeardownFailed`]
    pub async fn stop(&self, instance: &mut SutInstance, grace: Duration) -> Result<()> {
        if instance.state == InstanceState::Stopped && !instance.group_alive() {
            return Ok(());
        }

        let group = Pid::from_raw(-instance.pgid.as_raw());
        info!("Stopping process group {}", instance.pgid);
        if let Err(e) = kill(group, Signal::SIGTERM) {
            if e != nix::Error::ESRCH {
                warn!("Failed to send SIGTERM to group {}: {}", instance.pgid, e);
            }
        }

        if self.wait_for_group_exit(instance, grace).await {
            instance.state = InstanceState::Stopped;
            info!("Process group {} exited within grace period", instance.pgid);
            return Ok(());
        }

        warn!("Process group {} ignored SIGTERM for {:?}, sending SIGKILL", instance.pgid, grace);
        if let Err(e) = kill(group, Signal::SIGKILL) {
            if e != nix::Error::ESRCH {
                warn!("Failed to send SIGKILL to group {}: {}", instance.pgid, e);
            }
        }

        if self.wait_for_group_exit(instance, KILL_WAIT).await {
            instance.state = InstanceState::Stopped;
            return Ok(());
        }

        Err(HarnessError::TeardownFailed {
            pgid: instance.pgid.as_raw(),
            grace,
        }
        .into())
    }

    /// Waits for the leader to be reaped and the group to empty out
    async fn wait_for_group_exit(&self, instance: &mut SutInstance, limit: Duration) -> bool {
        let started = Instant::now();
        if let Some(child) = instance.child.as_mut() {
            match timeout(limit, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("Server exited with status {:?}", status);
                    instance.exit_status = Some(status);
                }
                Ok(Err(e)) => warn!("Error waiting for server process: {}", e),
                Err(_) => return false,
            }
        }
        // Grandchildren (CGI scripts) may outlive the leader briefly
        while group_alive(instance.pgid) {
            if started.elapsed() >= limit {
                return false;
            }
            sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Waits until none of `ports` accepts connections on `host`.
    ///
    /// Run before [`ProcessSupervisor::start`]: readiness is judged by a
    /// successful connect, so a listener left over from an earlier group or
    /// another process would pass it for the new server.
    ///
    /// # Returns
    /// * `Result<()>` - Success or [`HarnessError::PortBusy`] for the first
    ///   port still held when `deadline` runs out
    pub async fn ensure_released(&self, host: IpAddr, ports: &[u16], deadline: Duration) -> Result<()> {
        let started = Instant::now();
        for &port in ports {
            let addr = SocketAddr::new(host, port);
            while self.connect_once(addr).await {
                if started.elapsed() >= deadline {
                    warn!("Port {} still held after {:?}", port, started.elapsed());
                    return Err(HarnessError::PortBusy {
                        port,
                        waited: started.elapsed(),
                    }
                    .into());
                }
                sleep(self.retry_interval).await;
            }
            debug!("Port {} free", port);
        }
        Ok(())
    }

    async fn connect_once(&self, addr: SocketAddr) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                true
            }
            Ok(Err(e)) => {
                debug!("Readiness probe {} refused: {}", addr, e);
                false
            }
            Err(_) => {
                debug!("Readiness probe {} timed out", addr);
                false
            }
        }
    }
}

fn group_alive(pgid: Pid) -> bool {
    if kill(Pid::from_raw(-pgid.as_raw()), None).is_err() {
        return false;
    }
    // kill(2) also succeeds while unreaped zombies remain in the group
    match fs::read_dir("/proc") {
        Ok(entries) => entries
            .flatten()
            .filter_map(|entry| fs::read_to_string(entry.path().join("stat")).ok())
            .filter_map(|stat| parse_stat(&stat))
            .any(|(state, pgrp)| pgrp == pgid.as_raw() && state != 'Z'),
        Err(_) => true,
    }
}

/// Extracts (state, pgrp) from a `/proc/<pid>/stat` line
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    // comm may contain spaces and parentheses, so split after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn read_tail(path: &Path, limit: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len > limit {
        file.seek(SeekFrom::Start(len - limit))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
