use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(String),
    /// The scenario could not observe anything in this environment
    Skipped(String),
    /// The group's setup or teardown failed; the scenario never ran
    Aborted(String),
}

impl Verdict {
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Failed(_) | Verdict::Aborted(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Verdict::Passed => "PASS",
            Verdict::Failed(_) => "FAIL",
            Verdict::Skipped(_) => "SKIP",
            Verdict::Aborted(_) => "ABORT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: String,
    pub group: String,
    pub verdict: Verdict,
    pub elapsed: Duration,
    /// Extra observation for passing scenarios, e.g. measured latencies
    pub detail: Option<String>,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<5} {}::{} ({:.2}s)",
            self.verdict.label(),
            self.group,
            self.name,
            self.elapsed.as_secs_f64()
        )?;
        match (&self.verdict, &self.detail) {
            (Verdict::Failed(why) | Verdict::Skipped(why) | Verdict::Aborted(why), _) => write!(f, ": {}", why),
            (Verdict::Passed, Some(detail)) => write!(f, ": {}", detail),
            (Verdict::Passed, None) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub aborted: usize,
}

/// Results of one harness run
#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub scenarios: Vec<ScenarioReport>,
    /// Run-level fatal errors (teardown failures, missing binary)
    pub fatal: Vec<String>,
}

impl Default for SuiteReport {
    fn default() -> Self {
        Self::new()
    }
}

impl SuiteReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            scenarios: Vec::new(),
            fatal: Vec::new(),
        }
    }

    pub fn record(&mut self, report: ScenarioReport) {
        self.scenarios.push(report);
    }

    pub fn record_fatal(&mut self, message: impl Into<String>) {
        self.fatal.push(message.into());
    }

    pub fn summary(&self) -> Summary {
        self.scenarios.iter().fold(Summary::default(), |mut s, r| {
            match r.verdict {
                Verdict::Passed => s.passed += 1,
                Verdict::Failed(_) => s.failed += 1,
                Verdict::Skipped(_) => s.skipped += 1,
                Verdict::Aborted(_) => s.aborted += 1,
            }
            s
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.scenarios.iter().filter(|r| r.verdict.is_failure())
    }

    /// 0 when everything passed, 2 on any fatal error or aborted group, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        let summary = self.summary();
        if !self.fatal.is_empty() || summary.aborted > 0 {
            EXIT_FATAL
        } else if summary.failed > 0 {
            EXIT_FAILED
        } else {
            EXIT_PASSED
        }
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {} started {}", self.run_id, self.started_at.to_rfc3339())?;
        for scenario in &self.scenarios {
            writeln!(f, "{}", scenario)?;
        }
        for fatal in &self.fatal {
            writeln!(f, "FATAL {}", fatal)?;
        }
        let s = self.summary();
        write!(
            f,
            "{} passed, {} failed, {} skipped, {} aborted",
            s.passed, s.failed, s.skipped, s.aborted
        )
    }
}
