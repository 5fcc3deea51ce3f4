use crate::types::{GateResult, QualityThresholds};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Metrics aggregated from the results of a command's tasks.
///
/// Counts are summed across results; coverage and benchmark delta keep the
/// last reported value. A result may carry its metrics at the top level or
/// under a `metrics` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateMetrics {
    pub tests_passed: Option<u64>,
    pub tests_failed: Option<u64>,
    pub coverage: Option<f64>,
    pub lint_errors: Option<u64>,
    pub benchmark_delta: Option<f64>,
    pub approvals: u64,
    pub rejections: u64,
}

impl GateMetrics {
    pub fn collect(results: &[serde_json::Value]) -> Self {
        fn add(slot: &mut Option<u64>, value: Option<u64>) {
            if let Some(v) = value {
                *slot = Some(slot.unwrap_or(0) + v);
            }
        }

        let mut metrics = Self::default();
        for result in results {
            let source = result.get("metrics").unwrap_or(result);
            if !source.is_object() {
                continue;
            }
            add(&mut metrics.tests_passed, source.get("tests_passed").and_then(|v| v.as_u64()));
            add(&mut metrics.tests_failed, source.get("tests_failed").and_then(|v| v.as_u64()));
            add(&mut metrics.lint_errors, source.get("lint_errors").and_then(|v| v.as_u64()));
            if let Some(coverage) = source.get("coverage").and_then(|v| v.as_f64()) {
                metrics.coverage = Some(coverage);
            }
            if let Some(delta) = source.get("benchmark_delta").and_then(|v| v.as_f64()) {
                metrics.benchmark_delta = Some(delta);
            }
            match source.get("approved").and_then(|v| v.as_bool()) {
                Some(true) => metrics.approvals += 1,
                Some(false) => metrics.rejections += 1,
                None => {}
            }
        }
        metrics
    }
}

/// Everything a gate may inspect.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub command_id: Uuid,
    pub command_type: String,
    pub thresholds: QualityThresholds,
    pub metrics: GateMetrics,
    pub results: Vec<serde_json::Value>,
}

impl GateContext {
    pub fn new(
        command_id: Uuid,
        command_type: impl Into<String>,
        thresholds: QualityThresholds,
        results: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            command_id,
            command_type: command_type.into(),
            thresholds,
            metrics: GateMetrics::collect(&results),
            results,
        }
    }
}

/// A measurable check run after all of a command's tasks complete.
#[async_trait]
pub trait QualityGate: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, ctx: &GateContext) -> ConductorResult<GateResult>;
}

fn verdict(gate: &str, passed: bool, detail: impl Into<String>) -> GateResult {
    GateResult {
        gate: gate.to_string(),
        passed,
        detail: detail.into(),
    }
}

pub struct TestsPassGate;

#[async_trait]
impl QualityGate for TestsPassGate {
    fn name(&self) -> &str {
        "tests_pass"
    }

    async fn check(&self, ctx: &GateContext) -> ConductorResult<GateResult> {
        let m = &ctx.metrics;
        if m.tests_passed.is_none() && m.tests_failed.is_none() {
            return Ok(verdict(self.name(), false, "no test results reported"));
        }
        let failed = m.tests_failed.unwrap_or(0);
        let passed = m.tests_passed.unwrap_or(0);
        if failed > ctx.thresholds.max_failed_tests {
            return Ok(verdict(
                self.name(),
                false,
                format!("{failed} tests failed (allowed {})", ctx.thresholds.max_failed_tests),
            ));
        }
        Ok(verdict(self.name(), true, format!("{passed} passed, {failed} failed")))
    }
}

pub struct CoverageGate;

#[async_trait]
impl QualityGate for CoverageGate {
    fn name(&self) -> &str {
        "coverage"
    }

    async fn check(&self, ctx: &GateContext) -> ConductorResult<GateResult> {
        let min = ctx.thresholds.min_coverage;
        Ok(match ctx.metrics.coverage {
            None => verdict(self.name(), false, "no coverage reported"),
            Some(c) if c < min => verdict(self.name(), false, format!("coverage {c:.1}% below {min:.1}%")),
            Some(c) => verdict(self.name(), true, format!("coverage {c:.1}%")),
        })
    }
}

/// Passes when no lint results were reported.
pub struct LintGate;

#[async_trait]
impl QualityGate for LintGate {
    fn name(&self) -> &str {
        "lint"
    }

    async fn check(&self, ctx: &GateContext) -> ConductorResult<GateResult> {
        let max = ctx.thresholds.max_lint_errors;
        Ok(match ctx.metrics.lint_errors {
            None => verdict(self.name(), true, "no lint results reported"),
            Some(n) if n > max => verdict(self.name(), false, format!("{n} lint errors (allowed {max})")),
            Some(n) => verdict(self.name(), true, format!("{n} lint errors")),
        })
    }
}

pub struct BenchmarkGate;

#[async_trait]
impl QualityGate for BenchmarkGate {
    fn name(&self) -> &str {
        "benchmark"
    }

    async fn check(&self, ctx: &GateContext) -> ConductorResult<GateResult> {
        let min = ctx.thresholds.min_benchmark_delta;
        Ok(match ctx.metrics.benchmark_delta {
            None => verdict(self.name(), false, "no benchmark delta reported"),
            Some(d) if d < min => verdict(self.name(), false, format!("benchmark delta {d:+.1}% below {min:+.1}%")),
            Some(d) => verdict(self.name(), true, format!("benchmark delta {d:+.1}%")),
        })
    }
}

/// At least one approval and no rejection.
pub struct ReviewApprovalGate;

#[async_trait]
impl QualityGate for ReviewApprovalGate {
    fn name(&self) -> &str {
        "review_approval"
    }

    async fn check(&self, ctx: &GateContext) -> ConductorResult<GateResult> {
        let m = &ctx.metrics;
        Ok(if m.rejections > 0 {
            verdict(self.name(), false, format!("{} reviewer(s) rejected", m.rejections))
        } else if m.approvals == 0 {
            verdict(self.name(), false, "no approvals")
        } else {
            verdict(self.name(), true, format!("{} approval(s)", m.approvals))
        })
    }
}

/// Runs an external check program; passes on exit status 0.
///
/// The aggregated metrics are written to the program's stdin as JSON and the
/// command id is exported as `CONDUCTOR_COMMAND_ID`.
pub struct CommandGate {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

/// `[[commands.gates]]`: an external check registered under `name`,
/// replacing a built-in gate of the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandGateConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_gate_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_gate_timeout_ms() -> u64 {
    120_000
}

impl CommandGateConfig {
    pub fn validate(&self) -> ConductorResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConductorError::Config("quality gate name must not be empty".into()));
        }
        if self.program.trim().is_empty() {
            return Err(ConductorError::Config(format!(
                "quality gate '{}' has an empty program",
                self.name
            )));
        }
        Ok(())
    }
}

impl CommandGate {
    pub fn from_config(config: &CommandGateConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.program.clone(),
            config.args.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl QualityGate for CommandGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, ctx: &GateContext) -> ConductorResult<GateResult> {
        use tokio::io::AsyncWriteExt;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("CONDUCTOR_COMMAND_ID", ctx.command_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConductorError::Execution(format!("gate '{}' failed to start: {e}", self.name)))?;
        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(&ctx.metrics)?;
            // Written alongside the wait so a chatty program cannot stall on a full pipe.
            // A program that ignores stdin may close it early.
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
            });
        }

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(verdict(&self.name, true, "check passed")),
            Ok(Ok(output)) => Ok(verdict(
                &self.name,
                false,
                format!(
                    "check exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(verdict(
                &self.name,
                false,
                format!("check timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }
}

/// Gates resolved by name.
#[derive(Clone, Default)]
pub struct GateRegistry {
    gates: HashMap<String, Arc<dyn QualityGate>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TestsPassGate));
        registry.register(Arc::new(CoverageGate));
        registry.register(Arc::new(LintGate));
        registry.register(Arc::new(BenchmarkGate));
        registry.register(Arc::new(ReviewApprovalGate));
        registry
    }

    /// Add a gate, replacing any gate of the same name.
    pub fn register(&mut self, gate: Arc<dyn QualityGate>) {
        self.gates.insert(gate.name().to_string(), gate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn QualityGate>> {
        self.gates.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `names` in order, stopping at the first failure. An unknown gate
    /// or a gate that errors counts as a failure.
    pub async fn run(&self, names: &[String], ctx: &GateContext) -> Vec<GateResult> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = match self.get(name) {
                None => verdict(name, false, "unknown quality gate"),
                Some(gate) => match gate.check(ctx).await {
                    Ok(result) => result,
                    Err(e) => verdict(name, false, e.to_string()),
                },
            };
            if result.passed {
                info!(command_id = %ctx.command_id, gate = %name, detail = %result.detail, "Quality gate passed");
            } else {
                warn!(command_id = %ctx.command_id, gate = %name, detail = %result.detail, "Quality gate failed");
            }
            let passed = result.passed;
            results.push(result);
            if !passed {
                break;
            }
        }
        results
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(results: Vec<serde_json::Value>) -> GateContext {
        GateContext::new(Uuid::new_v4(), "RUN_TESTS", QualityThresholds::default(), results)
    }

    #[test]
    fn test_collect_metrics() {
        let m = GateMetrics::collect(&[
            json!({"tests_passed": 10, "tests_failed": 0, "coverage": 70.0}),
            json!({"metrics": {"tests_passed": 5, "coverage": 88.5, "lint_errors": 2}}),
            json!({"approved": true}),
            json!("plain text"),
        ]);
        assert_eq!(m.tests_passed, Some(15));
        assert_eq!(m.tests_failed, Some(0));
        assert_eq!(m.coverage, Some(88.5));
        assert_eq!(m.lint_errors, Some(2));
        assert_eq!(m.benchmark_delta, None);
        assert_eq!(m.approvals, 1);
    }

    #[tokio::test]
    async fn test_builtin_gates() {
        let passing = ctx(vec![json!({"tests_passed": 12, "coverage": 91.0, "lint_errors": 0})]);
        assert!(TestsPassGate.check(&passing).await.unwrap().passed);
        assert!(CoverageGate.check(&passing).await.unwrap().passed);
        assert!(LintGate.check(&passing).await.unwrap().passed);
        assert!(!BenchmarkGate.check(&passing).await.unwrap().passed);

        let failing = ctx(vec![json!({"tests_passed": 3, "tests_failed": 1, "coverage": 42.0})]);
        let tests = TestsPassGate.check(&failing).await.unwrap();
        assert!(!tests.passed);
        assert!(tests.detail.contains("1 tests failed"));
        assert!(!CoverageGate.check(&failing).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_review_approval() {
        assert!(!ReviewApprovalGate.check(&ctx(vec![])).await.unwrap().passed);
        let mixed = ctx(vec![json!({"approved": true}), json!({"approved": false})]);
        assert!(!ReviewApprovalGate.check(&mixed).await.unwrap().passed);
        let approved = ctx(vec![json!({"approved": true}), json!({"approved": true})]);
        assert!(ReviewApprovalGate.check(&approved).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_run_stops_at_first_failure() {
        let registry = GateRegistry::builtin();
        let names: Vec<String> = ["lint", "coverage", "tests_pass"].iter().map(|s| s.to_string()).collect();
        let results = registry.run(&names, &ctx(vec![json!({"tests_passed": 1})])).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert_eq!(results[1].gate, "coverage");
        assert!(!results[1].passed);
    }

    #[tokio::test]
    async fn test_unknown_gate_fails() {
        let registry = GateRegistry::new();
        let results = registry.run(&["nope".to_string()], &ctx(vec![])).await;
        assert_eq!(results[0].detail, "unknown quality gate");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_gate_exit_status() {
        let pass = CommandGate::new("true", "true", vec![], Duration::from_secs(5));
        assert!(pass.check(&ctx(vec![])).await.unwrap().passed);
        let fail = CommandGate::new("false", "false", vec![], Duration::from_secs(5));
        assert!(!fail.check(&ctx(vec![])).await.unwrap().passed);
    }
}
