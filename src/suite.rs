use super::Result;
use crate::cgi_gateway::CgiGatewayProbe;
use crate::errors::HarnessError;
use crate::fixtures::{FixtureLayout, FixtureLock, PermissionGuard, ScratchFile};
use crate::http_probe::{HttpProbe, ProbeRequest, ProbeResponse};
use crate::report::{ScenarioReport, SuiteReport, Verdict};
use crate::supervisor::{ProcessSupervisor, SutConfig, SutInstance};
use crate::timeout_scenarios::{Scenario, TimeoutPolicy, TimeoutScenarioRunner};
use nix::unistd::AccessFlags;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Settings shared by every configuration group of a run
#[derive(Debug, Clone)]
pub struct SuiteSettings {
    pub binary: PathBuf,
    pub layout: FixtureLayout,
    pub host: IpAddr,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    pub grace: Duration,
    /// How long a group's ports may keep accepting before its server starts
    pub release_timeout: Duration,
    /// Default timeout of structured HTTP requests
    pub request_timeout: Duration,
    pub cgi_timeout: Duration,
    /// Client-side timeout of the abandoned CGI request
    pub abandon_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    /// Directory of the per-group server log sinks
    pub log_dir: PathBuf,
    /// Only these groups run; empty runs all
    pub groups: Vec<String>,
}

impl SuiteSettings {
    pub fn new(binary: impl Into<PathBuf>, layout: FixtureLayout) -> Self {
        let log_dir = layout.project_root.join("logs");
        Self {
            binary: binary.into(),
            layout,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            readiness_timeout: Duration::from_secs(5),
            readiness_interval: Duration::from_millis(200),
            grace: Duration::from_secs(5),
            release_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            cgi_timeout: Duration::from_secs(10),
            abandon_timeout: Duration::from_secs(2),
            timeout_policy: TimeoutPolicy::default(),
            log_dir,
            groups: Vec::new(),
        }
    }

    fn selects(&self, group: &str) -> bool {
        self.groups.is_empty() || self.groups.iter().any(|g| g == group)
    }
}

/// Something a structured response must satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Status(u16),
    StatusIn(Vec<u16>),
    StatusAtLeast(u16),
    StatusNotIn(Vec<u16>),
    BodyContains(String),
    BodyTrimmedEquals(String),
    BodyEmpty,
    BodyNonEmpty,
    HeaderContains { name: String, needle: String },
    ContentLengthPositive,
    /// Whole response, send to last body byte, within this bound
    Within(Duration),
}

impl Expectation {
    pub fn body_contains(needle: &str) -> Self {
        Expectation::BodyContains(needle.to_string())
    }

    pub fn header_contains(name: &str, needle: &str) -> Self {
        Expectation::HeaderContains {
            name: name.to_string(),
            needle: needle.to_string(),
        }
    }

    /// Returns a description of the mismatch, if any
    pub fn check(&self, response: &ProbeResponse) -> Option<String> {
        let status = response.status.as_u16();
        let ok = match self {
            Expectation::Status(code) => status == *code,
            Expectation::StatusIn(codes) => codes.contains(&status),
            Expectation::StatusAtLeast(code) => status >= *code,
            Expectation::StatusNotIn(codes) => !codes.contains(&status),
            Expectation::BodyContains(needle) => response.text().contains(needle.as_str()),
            Expectation::BodyTrimmedEquals(expected) => response.text().trim() == expected,
            Expectation::BodyEmpty => response.body.is_empty(),
            Expectation::BodyNonEmpty => !response.body.is_empty(),
            Expectation::HeaderContains { name, needle } => response
                .header_all(name)
                .iter()
                .any(|value| value.contains(needle.as_str())),
            Expectation::ContentLengthPositive => response.content_length().is_some_and(|len| len > 0),
            Expectation::Within(bound) => response.elapsed <= *bound,
        };
        if ok {
            return None;
        }
        Some(match self {
            Expectation::BodyContains(_) | Expectation::BodyTrimmedEquals(_) | Expectation::BodyEmpty => {
                format!("expected {:?}, body was {:?}", self, truncate(&response.text(), 120))
            }
            Expectation::HeaderContains { name, .. } => {
                format!("expected {:?}, {} was {:?}", self, name, response.header_all(name))
            }
            Expectation::Within(_) => format!("expected {:?}, took {:?}", self, response.elapsed),
            _ => format!("expected {:?}, got {}", self, response.status),
        })
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Fixture change applied for the duration of one case
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureMutation {
    /// Creates a file under the www root and removes every permission bit
    UnreadableFile { path: String },
    /// Drops the write bits of a directory under the www root; `created`
    /// is removed afterwards if the server wrote it anyway
    ReadOnlyDir { path: String, created: String },
}

/// Guards that undo a [`FixtureMutation`] when dropped
struct AppliedMutation {
    _permissions: PermissionGuard,
    _scratch: ScratchFile,
}

impl FixtureMutation {
    /// Applies the mutation, or explains why it cannot be observed
    fn apply(&self, layout: &FixtureLayout) -> Result<std::result::Result<AppliedMutation, String>> {
        // Bound after `scratch` so the mode is restored before the file goes
        let (scratch, guard, denied) = match self {
            FixtureMutation::UnreadableFile { path } => {
                let scratch = ScratchFile::create(layout.www_path(path), b"secret")?;
                let guard = PermissionGuard::apply(scratch.path(), 0o000)?;
                let denied = guard.denies(AccessFlags::R_OK);
                (scratch, guard, denied)
            }
            FixtureMutation::ReadOnlyDir { path, created } => {
                let dir = layout.www_path(path);
                let scratch = ScratchFile::track(dir.join(created));
                let current = std::fs::metadata(&dir)
                    .map_err(|source| HarnessError::Fixture {
                        path: dir.clone(),
                        source,
                    })?
                    .permissions()
                    .mode();
                let read_only = current & !0o222 & 0o7777;
                let guard = PermissionGuard::apply(&dir, read_only)?;
                let denied = guard.denies(AccessFlags::W_OK);
                (scratch, guard, denied)
            }
        };
        if !denied {
            return Ok(Err(format!(
                "{} stays accessible to this user; permission bits are not enforced",
                guard.path().display()
            )));
        }
        Ok(Ok(AppliedMutation {
            _permissions: guard,
            _scratch: scratch,
        }))
    }
}

#[derive(Debug, Clone)]
pub enum CaseKind {
    Http {
        request: ProbeRequest,
        expectations: Vec<Expectation>,
        mutation: Option<FixtureMutation>,
    },
    Timeout(Scenario),
    GatewayTimeout { path: String },
    ClientAbandon { path: String },
}

#[derive(Debug, Clone)]
pub struct ScenarioCase {
    pub name: String,
    pub kind: CaseKind,
}

impl ScenarioCase {
    pub fn http(name: &str, request: ProbeRequest, expectations: Vec<Expectation>) -> Self {
        Self {
            name: name.to_string(),
            kind: CaseKind::Http {
                request,
                expectations,
                mutation: None,
            },
        }
    }

    pub fn with_mutation(mut self, fixture: FixtureMutation) -> Self {
        if let CaseKind::Http { mutation, .. } = &mut self.kind {
            *mutation = Some(fixture);
        }
        self
    }

    pub fn timeout(scenario: Scenario) -> Self {
        Self {
            name: scenario.name.clone(),
            kind: CaseKind::Timeout(scenario),
        }
    }
}

/// One server configuration and the cases run against it
#[derive(Debug, Clone)]
pub struct ConfigGroup {
    pub name: String,
    /// File name under the conf directory
    pub config_file: String,
    /// Every port the configuration binds; the first is the primary one
    pub ports: Vec<u16>,
    pub cases: Vec<ScenarioCase>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
}

/// How one configuration group ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Completed,
    Interrupted,
    /// The group's ports cannot be trusted any more; no later group may start
    Halted(String),
}

/// Clients bound to one running server
pub struct GroupContext {
    probe: HttpProbe,
    runner: TimeoutScenarioRunner,
    gateway: CgiGatewayProbe,
}

impl GroupContext {
    pub fn new(addr: SocketAddr, settings: &SuiteSettings) -> Result<Self> {
        let probe = HttpProbe::new(addr, settings.request_timeout)?;
        Ok(Self {
            runner: TimeoutScenarioRunner::new(addr, settings.timeout_policy.clone()),
            gateway: CgiGatewayProbe::new(probe.clone(), settings.cgi_timeout),
            probe,
        })
    }
}

/// Runs configuration groups one after another, each against a freshly
/// started server that is stopped before the next group binds its ports.
pub struct ScenarioSuite {
    settings: SuiteSettings,
    supervisor: ProcessSupervisor,
    groups: Vec<ConfigGroup>,
}

impl ScenarioSuite {
    pub fn new(settings: SuiteSettings) -> Result<Self> {
        let groups = Self::catalogue(&settings)?;
        Ok(Self::with_groups(settings, groups))
    }

    pub fn with_groups(settings: SuiteSettings, groups: Vec<ConfigGroup>) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(settings.readiness_interval),
            settings,
            groups,
        }
    }

    pub fn settings(&self) -> &SuiteSettings {
        &self.settings
    }

    pub fn groups(&self) -> &[ConfigGroup] {
        &self.groups
    }

    /// The conformance catalogue shipped with the fixtures tree
    pub fn catalogue(settings: &SuiteSettings) -> Result<Vec<ConfigGroup>> {
        let policy = &settings.timeout_policy;
        let mut default_cases = vec![
            ScenarioCase::http(
                "get_root",
                ProbeRequest::get("/"),
                vec![Expectation::Status(200), Expectation::body_contains("html")],
            ),
            ScenarioCase::http("get_index", ProbeRequest::get("/index.html"), vec![Expectation::Status(200)]),
            ScenarioCase::http("get_missing", ProbeRequest::get("/nonexistent.html"), vec![Expectation::Status(404)]),
            ScenarioCase::http(
                "get_text_file",
                ProbeRequest::get("/test.txt"),
                vec![Expectation::Status(200), Expectation::header_contains("content-type", "text/plain")],
            ),
            ScenarioCase::http(
                "head_root",
                ProbeRequest::head("/"),
                vec![Expectation::Status(200), Expectation::BodyEmpty, Expectation::ContentLengthPositive],
            ),
            ScenarioCase::http(
                "autoindex_listing",
                ProbeRequest::get("/autoindex/"),
                vec![
                    Expectation::Status(200),
                    Expectation::body_contains("<html"),
                    Expectation::body_contains("index"),
                ],
            ),
        ];
        default_cases.extend(Scenario::catalogue(policy).into_iter().map(ScenarioCase::timeout));

        let test_ports = vec![8080, 8081];
        let test_cases = vec![
            ScenarioCase::http("get_root", ProbeRequest::get("/"), vec![Expectation::Status(200)]),
            ScenarioCase::http(
                "unknown_method",
                ProbeRequest::new("FOO", "/")?,
                vec![Expectation::StatusAtLeast(400)],
            ),
            ScenarioCase::http(
                "custom_404_page",
                ProbeRequest::get("/nonexistent"),
                vec![Expectation::Status(404), Expectation::body_contains("Custom 404 Page")],
            ),
            ScenarioCase::http(
                "body_limit",
                ProbeRequest::post("/", "this body is longer than the configured limit"),
                vec![Expectation::Status(413)],
            ),
            ScenarioCase::http(
                "second_port",
                ProbeRequest::get("/").on_port(test_ports[1]),
                vec![Expectation::Status(200)],
            ),
            ScenarioCase {
                name: "cgi_client_abandon".to_string(),
                kind: CaseKind::ClientAbandon {
                    path: "/cgi-bin/hang.cgi".to_string(),
                },
            },
            ScenarioCase::http(
                "head_no_body",
                ProbeRequest::head("/"),
                vec![Expectation::Status(200), Expectation::BodyEmpty],
            ),
            ScenarioCase::http(
                "unreadable_file",
                ProbeRequest::get("/perm_denied.txt"),
                vec![Expectation::StatusIn(vec![403, 404, 500])],
            )
            .with_mutation(FixtureMutation::UnreadableFile {
                path: "perm_denied.txt".to_string(),
            }),
            ScenarioCase::http(
                "read_only_uploads",
                ProbeRequest::put("/uploads/perm_upload.txt", "data"),
                vec![Expectation::StatusNotIn(vec![200, 201])],
            )
            .with_mutation(FixtureMutation::ReadOnlyDir {
                path: "uploads".to_string(),
                created: "perm_upload.txt".to_string(),
            }),
            ScenarioCase::http(
                "unsatisfiable_range",
                ProbeRequest::get("/index.html").header("Range", "bytes=999999-1000000"),
                vec![
                    Expectation::StatusIn(vec![416, 200, 404]),
                    Expectation::Within(policy.admission_bound),
                ],
            ),
            ScenarioCase::http(
                "delete_missing_upload",
                ProbeRequest::delete("/uploads/nonexistent.txt"),
                vec![Expectation::Status(404)],
            ),
        ];

        let cgi_cases = vec![
            ScenarioCase::http(
                "cgi_basic",
                ProbeRequest::get("/cgi-bin/basic.sh"),
                vec![Expectation::Status(200), Expectation::BodyNonEmpty],
            ),
            ScenarioCase::http(
                "cgi_simple",
                ProbeRequest::get("/cgi-bin/simple.sh"),
                vec![Expectation::Status(200), Expectation::BodyNonEmpty],
            ),
            ScenarioCase::http(
                "cgi_post",
                ProbeRequest::post("/cgi-bin/post_test.sh", "name=webprobe&value=42")
                    .header("Content-Type", "application/x-www-form-urlencoded"),
                vec![Expectation::Status(200)],
            ),
            ScenarioCase::http(
                "cgi_environment",
                ProbeRequest::get("/cgi-bin/env_dump.sh?probe=1"),
                vec![
                    Expectation::Status(200),
                    Expectation::body_contains("REQUEST_METHOD=GET"),
                    Expectation::body_contains("QUERY_STRING=probe=1"),
                ],
            ),
            ScenarioCase::http(
                "cgi_set_cookie",
                ProbeRequest::get("/cgi-bin/setcookie.sh"),
                vec![Expectation::Status(200), Expectation::header_contains("set-cookie", "sess=abc123")],
            ),
            ScenarioCase::http(
                "cgi_cookie_round_trip",
                ProbeRequest::get("/cgi-bin/echo_cookie.sh").header("Cookie", "sess=abc123"),
                vec![Expectation::BodyTrimmedEquals("sess=abc123".to_string())],
            ),
        ];

        let complete_cases = vec![ScenarioCase {
            name: "cgi_gateway_timeout".to_string(),
            kind: CaseKind::GatewayTimeout {
                path: "/cgi-bin/infinite.sh".to_string(),
            },
        }];

        Ok(vec![
            ConfigGroup {
                name: "default".to_string(),
                config_file: "default.conf".to_string(),
                ports: vec![8080],
                cases: default_cases,
            },
            ConfigGroup {
                name: "test".to_string(),
                config_file: "test.conf".to_string(),
                ports: test_ports,
                cases: test_cases,
            },
            ConfigGroup {
                name: "cgi".to_string(),
                config_file: "cgi.conf".to_string(),
                ports: vec![8080],
                cases: cgi_cases,
            },
            ConfigGroup {
                name: "complete".to_string(),
                config_file: "complete.conf".to_string(),
                ports: vec![8080],
                cases: complete_cases,
            },
        ])
    }

    /// Runs every selected group, recording into `report`.
    ///
    /// Cancelling `cancel` stops the running case, tears the server down and
    /// returns [`RunOutcome::Interrupted`].
    pub async fn run(&self, report: &mut SuiteReport, cancel: &CancellationToken) -> RunOutcome {
        info!("Run {} started at {}", report.run_id, report.started_at.to_rfc3339());
        if let Err(e) = self.settings.layout.prepare() {
            error!("fixture preparation failed: {}", e);
            report.record_fatal(format!("fixture preparation failed: {}", e));
            return RunOutcome::Completed;
        }

        let selected: Vec<&ConfigGroup> = self.groups.iter().filter(|g| self.settings.selects(&g.name)).collect();
        for (index, group) in selected.iter().enumerate() {
            match self.run_group(group, report, cancel).await {
                GroupOutcome::Completed => {}
                GroupOutcome::Interrupted => return RunOutcome::Interrupted,
                GroupOutcome::Halted(reason) => {
                    error!("Run halted after group {}: {}", group.name, reason);
                    let reason = format!("run halted after group {}: {}", group.name, reason);
                    for rest in &selected[index + 1..] {
                        abort_cases(report, rest, &rest.cases, &reason);
                    }
                    break;
                }
            }
        }
        RunOutcome::Completed
    }

    /// ports free -> start -> await_ready -> cases -> stop for one
    /// configuration group.
    ///
    /// A port still held before start, or a server that survives teardown,
    /// is a fatal run-level error and yields [`GroupOutcome::Halted`].
    pub async fn run_group(&self, group: &ConfigGroup, report: &mut SuiteReport, cancel: &CancellationToken) -> GroupOutcome {
        info!("Group {} ({}) on ports {:?}", group.name, group.config_file, group.ports);
        if let Err(e) = self
            .supervisor
            .ensure_released(self.settings.host, &group.ports, self.settings.release_timeout)
            .await
        {
            error!("group {} cannot start: {}", group.name, e);
            report.record_fatal(format!("group {}: {}", group.name, e));
            abort_cases(report, group, &group.cases, &e.to_string());
            return GroupOutcome::Halted(e.to_string());
        }

        let config = SutConfig {
            binary: self.settings.binary.clone(),
            config_path: self.settings.layout.conf_path(&group.config_file),
            working_dir: self.settings.layout.project_root.clone(),
            log_path: self
                .settings
                .log_dir
                .join(format!("{}-{}.log", group.name, report.run_id)),
            host: self.settings.host,
            ports: group.ports.clone(),
            ..Default::default()
        };

        let mut instance = match self.supervisor.start(&config) {
            Ok(instance) => instance,
            Err(e) => {
                abort_cases(report, group, &group.cases, &e.to_string());
                return GroupOutcome::Completed;
            }
        };

        let ready = tokio::select! {
            _ = cancel.cancelled() => None,
            ready = self.supervisor.await_ready(&mut instance, &group.ports, self.settings.readiness_timeout) => Some(ready),
        };
        let outcome = match ready {
            None => GroupOutcome::Interrupted,
            Some(Err(e)) => {
                error!("group {} not ready: {}", group.name, e);
                abort_cases(report, group, &group.cases, &e.to_string());
                GroupOutcome::Completed
            }
            Some(Ok(_)) => self.run_cases(group, &mut instance, report, cancel).await,
        };

        let stopped = self.supervisor.stop(&mut instance, self.settings.grace).await;
        settle_teardown(report, group, stopped, outcome)
    }

    async fn run_cases(
        &self,
        group: &ConfigGroup,
        instance: &mut SutInstance,
        report: &mut SuiteReport,
        cancel: &CancellationToken,
    ) -> GroupOutcome {
        let ctx = match GroupContext::new(instance.primary_addr(), &self.settings) {
            Ok(ctx) => ctx,
            Err(e) => {
                abort_cases(report, group, &group.cases, &e.to_string());
                return GroupOutcome::Completed;
            }
        };

        for (index, case) in group.cases.iter().enumerate() {
            let started = Instant::now();
            let verdict = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Interrupted during {}::{}", group.name, case.name);
                    return GroupOutcome::Interrupted;
                }
                verdict = self.run_case(&ctx, case) => verdict,
            };
            let fatal = matches!(verdict, (Verdict::Aborted(_), _));
            record(report, group, case, verdict, started.elapsed());

            let remaining = &group.cases[index + 1..];
            if fatal {
                abort_cases(report, group, remaining, "aborted after a fatal error");
                break;
            }
            if let Some(status) = instance.try_exit_status() {
                let detail = format!(
                    "server exited with {} during {}\n--- captured output ---\n{}",
                    status,
                    case.name,
                    instance.captured_output()
                );
                error!("{}", detail);
                abort_cases(report, group, remaining, &detail);
                break;
            }
        }
        GroupOutcome::Completed
    }

    /// Runs one case; returns its verdict and an optional note for passes
    pub async fn run_case(&self, ctx: &GroupContext, case: &ScenarioCase) -> (Verdict, Option<String>) {
        info!("Case {} started", case.name);
        let result = match &case.kind {
            CaseKind::Http {
                request,
                expectations,
                mutation,
            } => self.run_http(ctx, request, expectations, mutation.as_ref()).await,
            CaseKind::Timeout(scenario) => ctx.runner.run_and_check(scenario).await.map(|obs| {
                let note = format!(
                    "fates {:?}, fresh connection {:?}",
                    obs.fates, obs.admission_latency
                );
                (Verdict::Passed, Some(note))
            }),
            CaseKind::GatewayTimeout { path } => ctx.gateway.probe_default(path).await.map(|result| {
                (Verdict::Passed, Some(format!("{:?} after {:?}", result.status, result.elapsed)))
            }),
            CaseKind::ClientAbandon { path } => ctx
                .gateway
                .client_abandon(path, self.settings.abandon_timeout)
                .await
                .map(|abandoned| {
                    let note = if abandoned { "client gave up" } else { "answered before client timeout" };
                    (Verdict::Passed, Some(note.to_string()))
                }),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => (verdict_from_error(&e), None),
        };
        info!("Case {} finished: {:?}", case.name, outcome.0);
        outcome
    }

    async fn run_http(
        &self,
        ctx: &GroupContext,
        request: &ProbeRequest,
        expectations: &[Expectation],
        mutation: Option<&FixtureMutation>,
    ) -> Result<(Verdict, Option<String>)> {
        // Lock and guards live until the response is checked
        let mut _lock = None;
        let mut _applied = None;
        if let Some(mutation) = mutation {
            _lock = Some(FixtureLock::acquire().await);
            match mutation.apply(&self.settings.layout)? {
                Ok(applied) => _applied = Some(applied),
                Err(reason) => return Ok((Verdict::Skipped(reason), None)),
            }
        }

        let response = ctx.probe.send(request.clone()).await?;
        let failures: Vec<String> = expectations.iter().filter_map(|e| e.check(&response)).collect();
        if failures.is_empty() {
            Ok((Verdict::Passed, Some(format!("{} in {:?}", response.status, response.elapsed))))
        } else {
            Ok((Verdict::Failed(failures.join("; ")), None))
        }
    }
}

/// Maps a case error onto its verdict
pub fn verdict_from_error(report: &eyre::Report) -> Verdict {
    match report.downcast_ref::<HarnessError>() {
        Some(HarnessError::Assertion { detail, .. }) => Verdict::Failed(detail.clone()),
        Some(err) if err.is_fatal() => Verdict::Aborted(err.to_string()),
        _ => Verdict::Failed(report.to_string()),
    }
}

/// Folds the teardown result into the group's outcome
fn settle_teardown(report: &mut SuiteReport, group: &ConfigGroup, stopped: Result<()>, outcome: GroupOutcome) -> GroupOutcome {
    match stopped {
        Ok(()) => outcome,
        Err(e) => {
            error!("teardown of group {} failed: {}", group.name, e);
            report.record_fatal(format!("group {}: {}", group.name, e));
            match outcome {
                GroupOutcome::Interrupted => GroupOutcome::Interrupted,
                _ => GroupOutcome::Halted(e.to_string()),
            }
        }
    }
}

fn record(report: &mut SuiteReport, group: &ConfigGroup, case: &ScenarioCase, outcome: (Verdict, Option<String>), elapsed: Duration) {
    let (verdict, detail) = outcome;
    report.record(ScenarioReport {
        name: case.name.clone(),
        group: group.name.clone(),
        verdict,
        elapsed,
        detail,
    });
}

fn abort_cases(report: &mut SuiteReport, group: &ConfigGroup, cases: &[ScenarioCase], reason: &str) {
    for case in cases {
        record(
            report,
            group,
            case,
            (Verdict::Aborted(reason.to_string()), None),
            Duration::ZERO,
        );
    }
}
