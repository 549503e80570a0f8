//! Top-level judging API
//!
//! Convenience entry points over the registry and managers:
//! - [`build`]: build a program, keeping build failures inside the manager
//! - [`execute`]: one run of an existing build
//! - [`run`]: build once and run every input set, optionally inside the
//!   sandboxed worker

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::build::{BuildManager, BuildOptions, BuildSummary};
use crate::config::get_config;
use crate::error::{JudgeError, Result};
use crate::isolation::worker::{IsolatedRequest, SandboxRunner, WorkerMode, WorkerSandbox};
use crate::isolation::{check_timeout, in_isolated_worker, with_timeout};
use crate::registry::{registry, Registry};
use crate::trace::{Outcome, TestCase};

/// Version of the serialized [`RunReport`] layout
pub const REPORT_VERSION: u32 = 1;

/// Options for [`run`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Time limit per input set; None means unbounded
    pub timeout: Option<Duration>,
    /// Build and run inside the isolated worker under a restricted identity
    pub sandbox: bool,
    /// Propagate the first failure as an error instead of a test case
    pub raises: bool,
    pub stream_compare: Option<bool>,
    pub extra_modules: Vec<String>,
}

impl RunOptions {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sandboxed(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn raising(mut self, raises: bool) -> Self {
        self.raises = raises;
        self
    }

    pub fn with_stream_compare(mut self, stream_compare: Option<bool>) -> Self {
        self.stream_compare = stream_compare;
        self
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions::default()
            .sandboxed(self.sandbox)
            .with_stream_compare(self.stream_compare)
            .with_extra_modules(self.extra_modules.clone())
    }
}

/// Every test case of one program, plus its build summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub version: u32,
    pub language: String,
    pub build: BuildSummary,
    pub cases: Vec<TestCase>,
}

impl RunReport {
    pub fn all_success(&self) -> bool {
        self.cases.iter().all(TestCase::is_success)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.cases.iter().filter(|case| case.outcome == outcome).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, case) in self.cases.iter().enumerate() {
            if idx > 0 {
                write!(f, "\n\n")?;
            }
            write!(f, "{}", case)?;
        }
        Ok(())
    }
}

/// Language from an explicit name, or from a file name's extension
pub fn resolve_language(language: Option<&str>, path: Option<&Path>) -> Result<String> {
    let registry = registry()?;
    match (language, path) {
        (Some(language), _) => Ok(registry.canonical(language)?.to_string()),
        (None, Some(path)) => {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            registry.resolve_language(&name)
        }
        (None, None) => Err(JudgeError::Config(
            "language must be given explicitly or through a file name".to_string(),
        )),
    }
}

/// Build `source`. Build failures are kept in the returned manager; only
/// judge-side problems are errors.
pub async fn build(language: &str, source: &str, options: BuildOptions) -> Result<Arc<BuildManager>> {
    build_in(registry()?, language, source, options).await
}

async fn build_in(
    registry: &Registry,
    language: &str,
    source: &str,
    options: BuildOptions,
) -> Result<Arc<BuildManager>> {
    let build = registry.new_build_manager(language, source, options)?;
    match build.build().await {
        Ok(_) => Ok(build),
        Err(JudgeError::Build(err)) => {
            debug!("{}: build failed: {}", build.language(), err);
            Ok(build)
        }
        Err(err) => Err(err),
    }
}

/// Run an existing build once against `inputs`
pub async fn execute(
    build: &Arc<BuildManager>,
    inputs: Vec<String>,
    timeout: Option<Duration>,
) -> Result<TestCase> {
    execute_in(registry()?, build, inputs, timeout).await
}

async fn execute_in(
    registry: &Registry,
    build: &Arc<BuildManager>,
    inputs: Vec<String>,
    timeout: Option<Duration>,
) -> Result<TestCase> {
    let mut run = registry.new_execution_manager(build.language(), build, inputs)?;
    run.run(timeout).await
}

/// Build `source` once and run it against every input set
pub async fn run(
    source: &str,
    language: &str,
    input_sets: Vec<Vec<String>>,
    options: &RunOptions,
) -> Result<RunReport> {
    run_in(registry()?, source, language, input_sets, options).await
}

async fn run_in(
    registry: &Registry,
    source: &str,
    language: &str,
    input_sets: Vec<Vec<String>>,
    options: &RunOptions,
) -> Result<RunReport> {
    check_timeout(options.timeout)?;

    if options.sandbox && !in_isolated_worker() {
        return run_in_worker(registry, source, language, input_sets, options).await;
    }

    let build = registry.new_build_manager(language, source, options.build_options())?;
    run_from_manager(registry, &build, input_sets, options).await
}

async fn run_in_worker(
    registry: &Registry,
    source: &str,
    language: &str,
    input_sets: Vec<Vec<String>>,
    options: &RunOptions,
) -> Result<RunReport> {
    let language = registry.canonical(language)?.to_string();
    let build_options = options.build_options();

    let mut capabilities = registry
        .new_build_manager(&language, source, build_options.clone())?
        .required_capabilities();
    capabilities.sort();
    capabilities.dedup();

    let sets = input_sets.len() as u32;
    let request = IsolatedRequest::new(
        WorkerMode::Run,
        &language,
        source,
        input_sets,
        options.timeout,
        build_options,
        capabilities,
    )
    .raising(options.raises);

    let limit = worker_time_limit(options.timeout, sets, get_config().compile_timeout);

    info!("{}: running {} input sets in sandboxed worker", language, sets);
    let sandbox = WorkerSandbox::from_config(true)?;
    let response = with_timeout(limit, sandbox.run_isolated(&request)).await??;
    response.into_report()
}

/// Bound for a whole worker: two toolchain steps, every run and a second
/// of slack. None when unbounded or too large to represent.
fn worker_time_limit(timeout: Option<Duration>, sets: u32, compile_timeout: Duration) -> Option<Duration> {
    timeout?
        .checked_mul(sets.max(1))?
        .checked_add(compile_timeout.checked_mul(2)?)?
        .checked_add(Duration::from_secs(1))
}

/// Run every input set against `build`, then close it
pub async fn run_from_manager(
    registry: &Registry,
    build: &Arc<BuildManager>,
    input_sets: Vec<Vec<String>>,
    options: &RunOptions,
) -> Result<RunReport> {

    let outcome = async {
        if let Err(err) = build.build().await {
            if !matches!(err, JudgeError::Build(_)) {
                return Err(err);
            }
        }
        let mut cases = Vec::with_capacity(input_sets.len());
        for inputs in input_sets {
            let mut run = registry
                .new_execution_manager(build.language(), build, inputs)?
                .raising(options.raises)
                .with_stream_compare(options.stream_compare);
            cases.push(run.run(options.timeout).await?);
        }
        Ok(cases)
    }
    .await;

    build.close().await;
    let summary = build.summary().await;

    Ok(RunReport {
        version: REPORT_VERSION,
        language: build.language().to_string(),
        build: summary,
        cases: outcome?,
    })
}
