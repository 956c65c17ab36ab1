use super::Result;
use crate::errors::HarnessError;
use crate::http_probe::{HttpProbe, ProbeOutcome, ProbeRequest};
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Below the configured bound, a 504 this much early still counts
const EARLY_TOLERANCE: Duration = Duration::from_millis(500);

/// Extra client-side wait past `max_elapsed` before the probe gives up
const CLIENT_HEADROOM: Duration = Duration::from_secs(1);

/// Measured outcome of one gateway-timeout probe
#[derive(Debug, Clone)]
pub struct GatewayProbeResult {
    pub path: String,
    /// `None` when no response arrived at all
    pub status: Option<StatusCode>,
    pub expected_status: StatusCode,
    pub elapsed: Duration,
    pub min_elapsed: Duration,
    pub max_elapsed: Duration,
}

impl GatewayProbeResult {
    pub fn passed(&self) -> bool {
        self.failure().is_none()
    }

    /// Describes why the result misses its expectation
    pub fn failure(&self) -> Option<String> {
        match self.status {
            None => Some(format!(
                "no response from {} after {:?}; the server does not bound CGI execution",
                self.path, self.elapsed
            )),
            Some(status) if status != self.expected_status => Some(format!(
                "{} returned {} after {:?}, expected {}",
                self.path, status, self.elapsed, self.expected_status
            )),
            Some(_) if self.elapsed < self.min_elapsed => Some(format!(
                "{} answered after {:?}, before the {:?} lower bound",
                self.path, self.elapsed, self.min_elapsed
            )),
            Some(_) if self.elapsed >= self.max_elapsed => Some(format!(
                "{} answered after {:?}, past the {:?} upper bound",
                self.path, self.elapsed, self.max_elapsed
            )),
            Some(_) => None,
        }
    }
}

/// Checks that the server enforces an upper bound on external process execution
#[derive(Debug, Clone)]
pub struct CgiGatewayProbe {
    probe: HttpProbe,
    cgi_timeout: Duration,
}

impl CgiGatewayProbe {
    pub fn new(probe: HttpProbe, cgi_timeout: Duration) -> Self {
        Self { probe, cgi_timeout }
    }

    /// `[cgi_timeout - 0.5s, cgi_timeout * 1.5)`
    pub fn expected_window(&self) -> (Duration, Duration) {
        (
            self.cgi_timeout.saturating_sub(EARLY_TOLERANCE),
            self.cgi_timeout.mul_f64(1.5),
        )
    }

    /// Requests `path` and measures status and wall-clock time to the response.
    ///
    /// The client timeout sits just past `max_elapsed`, so a server that
    /// never answers shows up as a result with no status instead of hanging.
    pub async fn measure(
        &self,
        path: &str,
        expected_status: StatusCode,
        min_elapsed: Duration,
        max_elapsed: Duration,
    ) -> GatewayProbeResult {
        info!("Probing gateway timeout on {} (window {:?}..{:?})", path, min_elapsed, max_elapsed);
        let request = ProbeRequest::get(path).timeout(max_elapsed + CLIENT_HEADROOM);
        let started = Instant::now();
        let (status, elapsed) = match self.probe.try_send(request).await {
            ProbeOutcome::Response(response) => (Some(response.status), response.elapsed),
            ProbeOutcome::TimedOut(after) => (None, after),
            ProbeOutcome::Transport(detail) => {
                let after = started.elapsed();
                warn!("gateway probe on {} failed at transport level after {:?}: {}", path, after, detail);
                (None, after)
            }
        };
        GatewayProbeResult {
            path: path.to_string(),
            status,
            expected_status,
            elapsed,
            min_elapsed,
            max_elapsed,
        }
    }

    /// Like [`Self::measure`], failing with [`HarnessError::Assertion`] on a miss
    pub async fn probe_gateway_timeout(
        &self,
        path: &str,
        expected_status: StatusCode,
        min_elapsed: Duration,
        max_elapsed: Duration,
    ) -> Result<GatewayProbeResult> {
        let result = self.measure(path, expected_status, min_elapsed, max_elapsed).await;
        match result.failure() {
            None => {
                info!("{} answered {:?} after {:?}", path, result.status, result.elapsed);
                Ok(result)
            }
            Some(detail) => Err(HarnessError::assertion("gateway_timeout", detail).into()),
        }
    }

    /// Expects 504 within [`Self::expected_window`]
    pub async fn probe_default(&self, path: &str) -> Result<GatewayProbeResult> {
        let (min, max) = self.expected_window();
        self.probe_gateway_timeout(path, StatusCode::GATEWAY_TIMEOUT, min, max)
            .await
    }

    /// Gives up on a hanging CGI request after `client_timeout`, then
    /// requires `GET /` to answer 200.
    ///
    /// Returns whether the client actually abandoned the request.
    pub async fn client_abandon(&self, path: &str, client_timeout: Duration) -> Result<bool> {
        let abandoned = match self
            .probe
            .try_send(ProbeRequest::get(path).timeout(client_timeout))
            .await
        {
            ProbeOutcome::TimedOut(after) => {
                info!("Abandoned {} after {:?}", path, after);
                true
            }
            ProbeOutcome::Response(response) => {
                info!("{} answered {} before the client gave up", path, response.status);
                false
            }
            ProbeOutcome::Transport(detail) => {
                warn!("{} failed before the client gave up: {}", path, detail);
                false
            }
        };

        let index = self
            .probe
            .try_send(ProbeRequest::get("/").timeout(client_timeout))
            .await;
        match index {
            ProbeOutcome::Response(response) if response.status == StatusCode::OK => Ok(abandoned),
            ProbeOutcome::Response(response) => Err(HarnessError::assertion(
                "cgi_client_abandon",
                format!("GET / returned {} after abandoning {}", response.status, path),
            )
            .into()),
            other => Err(HarnessError::assertion(
                "cgi_client_abandon",
                format!("server unresponsive after abandoning {}: {:?}", path, other),
            )
            .into()),
        }
    }
}
