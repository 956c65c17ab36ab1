use super::Result;
use crate::errors::HarnessError;
use crate::raw_socket::{parse_response_head, Connection, RawSocketDriver, RecvOutcome, StallFate};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Smallest accepted safety margin on top of a server-side timeout
pub const MIN_SAFETY_MARGIN: f64 = 0.5;

/// Receive buffer used to make the slow client back-pressure the server
const SLOW_CLIENT_RECV_BUFFER: usize = 4096;

/// Bytes read before the slow client stops reading
const SLOW_CLIENT_PREFIX: usize = 100;

/// Server-side timeouts the scenarios are calibrated against
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    /// Time a connection may sit on an incomplete request
    pub idle_timeout: Duration,
    /// Time an idle keep-alive connection is kept
    pub keepalive_timeout: Duration,
    /// Time a response write may stall on a client that does not read
    pub write_timeout: Duration,
    /// Fraction added to every timeout before the harness acts on it
    pub safety_margin: f64,
    /// Upper bound for a well-formed request on a fresh connection
    pub admission_bound: Duration,
    /// Stalled peers in the isolation scenario
    pub stalled_connections: usize,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            safety_margin: MIN_SAFETY_MARGIN,
            admission_bound: Duration::from_secs(2),
            stalled_connections: 3,
        }
    }
}

impl TimeoutPolicy {
    /// Time to wait so that `server_timeout` has certainly fired
    pub fn wait_past(&self, server_timeout: Duration) -> Duration {
        server_timeout.mul_f64(1.0 + self.safety_margin.max(MIN_SAFETY_MARGIN))
    }

    /// Slack on top of the wait for follow-up probes and the admission check
    pub fn settle_allowance(&self) -> Duration {
        self.admission_bound * 4
    }

    pub fn validate(&self) -> Result<()> {
        if self.safety_margin < MIN_SAFETY_MARGIN {
            return Err(eyre::eyre!(
                "safety margin {} is below the minimum of {}",
                self.safety_margin,
                MIN_SAFETY_MARGIN
            ));
        }
        if self.stalled_connections < 2 {
            return Err(eyre::eyre!(
                "isolation needs at least 2 stalled connections, got {}",
                self.stalled_connections
            ));
        }
        if self.idle_timeout.is_zero() || self.keepalive_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(eyre::eyre!("server timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// What the stalled connection sends before going quiet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestShape {
    /// A full `GET` with its terminating blank line
    Complete,
    /// Request line only
    RequestLineOnly,
    /// Request line and headers, no terminating blank line
    MissingBlankLine,
    /// A `POST` whose body stops short of the declared length
    TruncatedBody { path: String, declared: usize, sent: usize },
}

impl RequestShape {
    /// Bytes sent before the stall
    pub fn initial_bytes(&self, host: &str) -> Vec<u8> {
        match self {
            RequestShape::Complete => format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\n\r\n", host).into_bytes(),
            RequestShape::RequestLineOnly => b"GET / HTTP/1.1\r\n".to_vec(),
            RequestShape::MissingBlankLine => format!("GET / HTTP/1.1\r\nHost: {}\r\n", host).into_bytes(),
            RequestShape::TruncatedBody { path, declared, sent } => {
                let mut bytes = format!(
                    "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n",
                    path, host, declared
                )
                .into_bytes();
                bytes.extend(std::iter::repeat(b'A').take(*sent));
                bytes
            }
        }
    }

    /// Bytes sent after the stall to find out whether the socket survived
    pub fn follow_up(&self, host: &str) -> Vec<u8> {
        match self {
            RequestShape::Complete => format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host).into_bytes(),
            RequestShape::RequestLineOnly => format!("Host: {}\r\n\r\n", host).into_bytes(),
            RequestShape::MissingBlankLine => b"Connection: keep-alive\r\n\r\n".to_vec(),
            RequestShape::TruncatedBody { sent, .. } => vec![b'B'; *sent],
        }
    }
}

/// Acceptable terminal state of the stalled connection itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedFate {
    PeerClosed,
    LeftOpen,
    Either,
}

impl ExpectedFate {
    pub fn accepts(&self, fate: &StallFate) -> bool {
        match (self, fate) {
            (ExpectedFate::Either, _) => true,
            (ExpectedFate::PeerClosed, StallFate::PeerClosed) => true,
            (ExpectedFate::LeftOpen, StallFate::LeftOpen { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioKind {
    IdleRead,
    SlowClientWrite { path: String },
    Isolation { stalled: usize },
    PostTimeoutAdmission,
    KeepAliveIdle,
}

/// A declarative timeout scenario; built once, evaluated once per run
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub kind: ScenarioKind,
    pub shape: RequestShape,
    pub min_elapsed: Duration,
    pub max_elapsed: Duration,
    pub expected_fate: ExpectedFate,
}

impl Scenario {
    fn waiting(name: &str, kind: ScenarioKind, shape: RequestShape, wait: Duration, policy: &TimeoutPolicy) -> Self {
        Self {
            name: name.to_string(),
            kind,
            shape,
            min_elapsed: wait,
            max_elapsed: wait + policy.settle_allowance(),
            expected_fate: ExpectedFate::Either,
        }
    }

    pub fn idle_read(policy: &TimeoutPolicy, shape: RequestShape) -> Self {
        Self::waiting("idle_read_timeout", ScenarioKind::IdleRead, shape, policy.wait_past(policy.idle_timeout), policy)
    }

    pub fn slow_client_write(policy: &TimeoutPolicy, path: &str) -> Self {
        Self::waiting(
            "slow_client_write_stall",
            ScenarioKind::SlowClientWrite { path: path.to_string() },
            RequestShape::Complete,
            policy.wait_past(policy.write_timeout),
            policy,
        )
    }

    pub fn isolation(policy: &TimeoutPolicy) -> Self {
        Self::waiting(
            "multi_connection_isolation",
            ScenarioKind::Isolation {
                stalled: policy.stalled_connections,
            },
            RequestShape::MissingBlankLine,
            policy.wait_past(policy.idle_timeout),
            policy,
        )
    }

    pub fn post_timeout_admission(policy: &TimeoutPolicy) -> Self {
        Self::waiting(
            "post_timeout_admission",
            ScenarioKind::PostTimeoutAdmission,
            RequestShape::RequestLineOnly,
            policy.wait_past(policy.idle_timeout),
            policy,
        )
    }

    pub fn keepalive_idle(policy: &TimeoutPolicy) -> Self {
        Self::waiting(
            "keepalive_idle_timeout",
            ScenarioKind::KeepAliveIdle,
            RequestShape::Complete,
            policy.wait_past(policy.keepalive_timeout),
            policy,
        )
    }

    pub fn large_body_stall(policy: &TimeoutPolicy) -> Self {
        let mut scenario = Self::idle_read(
            policy,
            RequestShape::TruncatedBody {
                path: "/upload".to_string(),
                declared: 1_000_000,
                sent: 1000,
            },
        );
        scenario.name = "large_body_stall".to_string();
        scenario
    }

    pub fn with_expected_fate(mut self, fate: ExpectedFate) -> Self {
        self.expected_fate = fate;
        self
    }

    /// Every timeout scenario, in the order a suite runs them
    pub fn catalogue(policy: &TimeoutPolicy) -> Vec<Scenario> {
        vec![
            Self::idle_read(policy, RequestShape::MissingBlankLine),
            Self::slow_client_write(policy, "/test.txt"),
            Self::isolation(policy),
            Self::post_timeout_admission(policy),
            Self::keepalive_idle(policy),
            Self::large_body_stall(policy),
        ]
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?}..{:?}]", self.name, self.min_elapsed, self.max_elapsed)
    }
}

/// What a scenario run observed
#[derive(Debug, Clone)]
pub struct ScenarioObservation {
    pub scenario: String,
    pub elapsed: Duration,
    /// Fates of the stalled connections
    pub fates: Vec<StallFate>,
    /// Latency of the well-formed request raced against the stalls
    pub primary_latency: Option<Duration>,
    /// Latency of the fresh-connection check after the stall
    pub admission_latency: Duration,
}

/// Drives raw connections through the timeout scenarios against one server
#[derive(Debug, Clone)]
pub struct TimeoutScenarioRunner {
    driver: RawSocketDriver,
    target: SocketAddr,
    host: String,
    policy: TimeoutPolicy,
}

impl TimeoutScenarioRunner {
    pub fn new(target: SocketAddr, policy: TimeoutPolicy) -> Self {
        Self {
            driver: RawSocketDriver::default(),
            target,
            host: "localhost".to_string(),
            policy,
        }
    }

    pub fn with_driver(mut self, driver: RawSocketDriver) -> Self {
        self.driver = driver;
        self
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Runs `scenario` and checks the observation against its bounds
    pub async fn run_and_check(&self, scenario: &Scenario) -> Result<ScenarioObservation> {
        let observation = self.run(scenario).await?;
        self.evaluate(scenario, &observation)?;
        Ok(observation)
    }

    /// Runs `scenario` without judging elapsed-time bounds.
    ///
    /// Liveness failures (no answer on a fresh connection) are still
    /// reported as [`HarnessError::Assertion`].
    pub async fn run(&self, scenario: &Scenario) -> Result<ScenarioObservation> {
        info!("Running {}", scenario);
        let started = Instant::now();
        let (fates, primary_latency) = match &scenario.kind {
            ScenarioKind::IdleRead => (vec![self.stall_once(scenario, scenario.min_elapsed).await?], None),
            ScenarioKind::SlowClientWrite { path } => (vec![self.slow_client(scenario, path).await?], None),
            ScenarioKind::Isolation { stalled } => {
                let (fates, latency) = self.isolation(scenario, *stalled).await?;
                (fates, Some(latency))
            }
            ScenarioKind::PostTimeoutAdmission => return self.admission_after_stall(scenario, started).await,
            ScenarioKind::KeepAliveIdle => (vec![self.keepalive(scenario).await?], None),
        };
        let admission_latency = self.admission_check(&scenario.name).await?;
        let observation = ScenarioObservation {
            scenario: scenario.name.clone(),
            elapsed: started.elapsed(),
            fates,
            primary_latency,
            admission_latency,
        };
        info!(
            "{} finished in {:?}, fates {:?}, admission {:?}",
            scenario.name, observation.elapsed, observation.fates, observation.admission_latency
        );
        Ok(observation)
    }

    /// Checks elapsed bounds, stalled-connection fates and latencies
    pub fn evaluate(&self, scenario: &Scenario, observation: &ScenarioObservation) -> Result<()> {
        let fail = |detail: String| -> Result<()> { Err(HarnessError::assertion(&scenario.name, detail).into()) };

        if observation.elapsed < scenario.min_elapsed {
            return fail(format!(
                "finished after {:?}, before the server timeout could fire ({:?})",
                observation.elapsed, scenario.min_elapsed
            ));
        }
        if observation.elapsed > scenario.max_elapsed {
            return fail(format!(
                "took {:?}, more than the {:?} bound",
                observation.elapsed, scenario.max_elapsed
            ));
        }
        if let Some(fate) = observation.fates.iter().find(|f| !scenario.expected_fate.accepts(f)) {
            return fail(format!("stalled connection ended {:?}, expected {:?}", fate, scenario.expected_fate));
        }
        if let Some(latency) = observation.primary_latency {
            if latency > self.policy.admission_bound {
                return fail(format!(
                    "well-formed request took {:?} next to stalled peers (bound {:?})",
                    latency, self.policy.admission_bound
                ));
            }
        }
        if observation.admission_latency > self.policy.admission_bound {
            return fail(format!(
                "fresh connection answered after {:?} (bound {:?})",
                observation.admission_latency, self.policy.admission_bound
            ));
        }
        Ok(())
    }

    /// Opens a fresh connection, sends `GET /` and requires a 200 within the
    /// admission bound. Returns the observed latency.
    pub async fn admission_check(&self, scenario: &str) -> Result<Duration> {
        let mut conn = self.driver.open(self.target).await?;
        let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", self.host);
        let sent_at = Instant::now();
        conn.send_raw(request.as_bytes()).await;
        let outcome = conn.read_response_head(self.policy.admission_bound).await;
        let latency = sent_at.elapsed();
        conn.close();

        match status_of(&outcome) {
            Some(200) => {
                debug!("{}: fresh connection answered 200 in {:?}", scenario, latency);
                Ok(latency)
            }
            status => Err(HarnessError::assertion(
                scenario,
                format!(
                    "fresh connection after stall got {} within {:?} (wanted 200)",
                    describe(status, &outcome),
                    self.policy.admission_bound
                ),
            )
            .into()),
        }
    }

    async fn stall_once(&self, scenario: &Scenario, hold: Duration) -> Result<StallFate> {
        let mut conn = self.driver.open(self.target).await?;
        conn.send_raw(&scenario.shape.initial_bytes(&self.host)).await;
        sleep(hold).await;
        let fate = conn
            .classify_stall(&scenario.shape.follow_up(&self.host), self.policy.admission_bound)
            .await;
        conn.close();
        Ok(fate)
    }

    async fn slow_client(&self, scenario: &Scenario, path: &str) -> Result<StallFate> {
        let mut conn = self
            .driver
            .open_with_recv_buffer(self.target, SLOW_CLIENT_RECV_BUFFER)
            .await?;
        let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, self.host);
        conn.send_raw(request.as_bytes()).await;

        match conn
            .recv_with_deadline(SLOW_CLIENT_PREFIX, self.policy.admission_bound)
            .await
        {
            RecvOutcome::Data(prefix) => debug!("{}: read {} byte prefix, stalling", scenario.name, prefix.len()),
            other => {
                return Err(HarnessError::assertion(
                    &scenario.name,
                    format!("no response prefix for {} ({:?})", path, other),
                )
                .into())
            }
        }

        sleep(scenario.min_elapsed).await;

        let (_, terminal) = conn.drain(64 * 1024 * 1024, self.policy.admission_bound).await;
        let fate = match terminal {
            RecvOutcome::Closed | RecvOutcome::Reset => StallFate::PeerClosed,
            _ => StallFate::LeftOpen { late_status: None },
        };
        conn.close();
        Ok(fate)
    }

    async fn isolation(&self, scenario: &Scenario, stalled: usize) -> Result<(Vec<StallFate>, Duration)> {
        let started = tokio::time::Instant::now();
        let hold = scenario.min_elapsed;
        let token = CancellationToken::new();
        let mut holders = JoinSet::new();

        // Every stalled peer is in place before the well-formed request
        for _ in 0..stalled {
            let mut conn = self.driver.open(self.target).await?;
            conn.send_raw(&scenario.shape.initial_bytes(&self.host)).await;
            holders.spawn(hold_stalled(
                conn,
                token.child_token(),
                hold,
                scenario.shape.follow_up(&self.host),
                self.policy.admission_bound,
            ));
        }

        let mut complete = self.driver.open(self.target).await?;
        let sent_at = Instant::now();
        complete
            .send_raw(&RequestShape::Complete.initial_bytes(&self.host))
            .await;
        let outcome = complete.read_response_head(self.policy.admission_bound).await;
        let latency = sent_at.elapsed();
        complete.close();

        if status_of(&outcome) != Some(200) {
            token.cancel();
            holders.abort_all();
            return Err(HarnessError::assertion(
                &scenario.name,
                format!(
                    "well-formed request next to {} stalled peers got {} after {:?}",
                    stalled,
                    describe(status_of(&outcome), &outcome),
                    latency
                ),
            )
            .into());
        }
        info!("{}: well-formed request answered in {:?} beside {} stalled peers", scenario.name, latency, stalled);

        sleep_until(started + hold).await;
        token.cancel();

        let mut fates = Vec::with_capacity(stalled);
        let collect = async {
            while let Some(joined) = holders.join_next().await {
                match joined {
                    Ok(fate) => fates.push(fate),
                    Err(e) => warn!("stalled connection task failed: {}", e),
                }
            }
        };
        if timeout(self.policy.settle_allowance(), collect).await.is_err() {
            warn!("{}: stalled connections did not settle, aborting them", scenario.name);
            holders.abort_all();
        }
        Ok((fates, latency))
    }

    async fn admission_after_stall(&self, scenario: &Scenario, started: Instant) -> Result<ScenarioObservation> {
        let mut stalled = self.driver.open(self.target).await?;
        stalled.send_raw(&scenario.shape.initial_bytes(&self.host)).await;
        sleep(scenario.min_elapsed).await;

        // Issued strictly after the wait, independent of how the stalled socket is reaped
        let admission_latency = self.admission_check(&scenario.name).await?;

        let fate = stalled
            .classify_stall(&scenario.shape.follow_up(&self.host), self.policy.admission_bound)
            .await;
        stalled.close();

        Ok(ScenarioObservation {
            scenario: scenario.name.clone(),
            elapsed: started.elapsed(),
            fates: vec![fate],
            primary_latency: None,
            admission_latency,
        })
    }

    async fn keepalive(&self, scenario: &Scenario) -> Result<StallFate> {
        let mut conn = self.driver.open(self.target).await?;
        conn.send_raw(&scenario.shape.initial_bytes(&self.host)).await;
        let outcome = conn.read_response_head(self.policy.admission_bound).await;
        if status_of(&outcome) != Some(200) {
            return Err(HarnessError::assertion(
                &scenario.name,
                format!("keep-alive request got {}", describe(status_of(&outcome), &outcome)),
            )
            .into());
        }
        if let RecvOutcome::Data(bytes) = &outcome {
            consume_body(&mut conn, bytes, self.policy.admission_bound).await;
        }

        sleep(scenario.min_elapsed).await;
        let fate = conn
            .classify_stall(&scenario.shape.follow_up(&self.host), self.policy.admission_bound)
            .await;
        conn.close();
        Ok(fate)
    }
}

/// Holds one stalled connection until cancelled or closed by the server
async fn hold_stalled(
    mut conn: Connection,
    token: CancellationToken,
    hold: Duration,
    follow_up: Vec<u8>,
    probe: Duration,
) -> StallFate {
    let peer_closed = tokio::select! {
        _ = token.cancelled() => false,
        outcome = conn.recv_with_deadline(1024, hold) => {
            matches!(outcome, RecvOutcome::Closed | RecvOutcome::Reset)
        }
    };
    let fate = if peer_closed {
        StallFate::PeerClosed
    } else {
        conn.classify_stall(&follow_up, probe).await
    };
    conn.close();
    fate
}

/// Reads whatever remains of a Content-Length body so the connection is idle
async fn consume_body(conn: &mut Connection, head_bytes: &[u8], deadline: Duration) {
    let Some(head) = parse_response_head(head_bytes) else { return };
    let Some(length) = head.content_length() else { return };
    let mut have = head_bytes.len().saturating_sub(head.body_offset);
    let started = Instant::now();
    while have < length {
        let remaining = deadline.saturating_sub(started.elapsed());
        match conn.recv_with_deadline(length - have, remaining).await {
            RecvOutcome::Data(chunk) => have += chunk.len(),
            _ => return,
        }
    }
}

fn status_of(outcome: &RecvOutcome) -> Option<u16> {
    match outcome {
        RecvOutcome::Data(bytes) => parse_response_head(bytes).map(|h| h.status.as_u16()),
        _ => None,
    }
}

fn describe(status: Option<u16>, outcome: &RecvOutcome) -> String {
    match (status, outcome) {
        (Some(code), _) => format!("status {}", code),
        (None, RecvOutcome::Data(bytes)) => format!("unparsable reply ({} bytes)", bytes.len()),
        (None, other) => format!("{:?}", other),
    }
}
