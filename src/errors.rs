use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy of a harness run.
///
/// Setup and teardown failures are fatal for the configuration group they
/// occur in. Assertion failures are scoped to a single scenario. Transport
/// resets during stall scenarios are not errors at all; they are reported
/// through [`crate::raw_socket::RecvOutcome`] and
/// [`crate::raw_socket::SendOutcome`].
#[derive(Debug, Error)]
pub enum HarnessError {
    /// No executable SUT binary could be located
    #[error("server binary not found; tried: {}", format_candidates(.tried))]
    BinaryNotFound { tried: Vec<PathBuf> },

    /// The SUT process could not be spawned at all
    #[error("failed to spawn {binary}: {source}")]
    SpawnFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Readiness deadline elapsed while the process was still alive
    #[error("server not accepting connections on {ports:?} after {waited:?}\n--- captured output ---\n{output}")]
    NotReady {
        ports: Vec<u16>,
        waited: Duration,
        output: String,
    },

    /// The process died before it ever accepted a connection
    #[error("server exited with {status} before becoming ready\n--- captured output ---\n{output}")]
    ExitedBeforeReady { status: ExitStatus, output: String },

    /// The process group survived SIGTERM, the grace period and SIGKILL
    #[error("process group {pgid} still alive after {grace:?} grace period and SIGKILL")]
    TeardownFailed { pgid: i32, grace: Duration },

    /// A port of the next configuration still accepts connections before
    /// its server was started: a leaked or foreign listener holds it
    #[error("port {port} still accepting connections after {waited:?}; refusing to start a server on it")]
    PortBusy { port: u16, waited: Duration },

    /// A connection the scenario needed could not be established
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An observed outcome did not match the expectation
    #[error("[{scenario}] {detail}")]
    Assertion { scenario: String, detail: String },

    /// Preparing or restoring fixture files failed
    #[error("fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    /// Whether the error invalidates every remaining scenario of the group
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::BinaryNotFound { .. }
                | HarnessError::SpawnFailed { .. }
                | HarnessError::NotReady { .. }
                | HarnessError::ExitedBeforeReady { .. }
                | HarnessError::TeardownFailed { .. }
                | HarnessError::PortBusy { .. }
        )
    }

    pub fn assertion(scenario: impl Into<String>, detail: impl Into<String>) -> Self {
        HarnessError::Assertion {
            scenario: scenario.into(),
            detail: detail.into(),
        }
    }
}

/// Returns true when `report` carries a fatal [`HarnessError`]
pub fn is_fatal_report(report: &eyre::Report) -> bool {
    report
        .downcast_ref::<HarnessError>()
        .is_some_and(HarnessError::is_fatal)
}

fn format_candidates(tried: &[PathBuf]) -> String {
    tried
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
