//! Execution module - one run of a built program against one input list
//!
//! An [`ExecutionManager`] borrows its artifact from a shared
//! [`BuildManager`]:
//! - `run()` builds lazily, interacts under a time limit and returns a
//!   classified [`TestCase`]
//! - `run_interactive()` connects the program to the real terminal
//!
//! The execution module does NOT:
//! - Compare traces against expected answers
//! - Own or clean up build artifacts

pub mod external;
pub mod in_process;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::build::{Artifact, BuildManager, LogLevel};
use crate::error::{JudgeError, Result};
use crate::isolation::{check_timeout, with_timeout};
use crate::trace::{SharedTrace, TestCase};

/// Everything a strategy needs for one interaction
#[derive(Debug, Clone)]
pub struct RunContext {
    pub build: Arc<BuildManager>,
    pub artifact: Arc<Artifact>,
    pub inputs: Vec<String>,
    pub timeout: Option<Duration>,
    pub stream_compare: bool,
    /// Written by the strategy while it interacts
    pub trace: SharedTrace,
}

/// Language-specific execution behaviour
#[async_trait]
pub trait ExecutionStrategy: fmt::Debug + Send + Sync {
    /// Stream-compare mode used when neither run nor build overrides it
    fn default_stream_compare(&self) -> bool {
        false
    }

    /// Extra time granted past the run limit before the supervisor gives
    /// up, for strategies that enforce the limit themselves elsewhere
    fn supervision_grace(&self, _timeout: Duration) -> Duration {
        Duration::ZERO
    }

    /// Feed the inputs and record the trace
    async fn interact(&self, ctx: &RunContext) -> Result<TestCase>;

    /// Connect the program to the judge's own stdin and stdout
    async fn interact_with_user(&self, build: &BuildManager, artifact: Arc<Artifact>) -> Result<()>;
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Started,
    Closed,
}

/// Owns one run of a shared build
#[derive(Debug)]
pub struct ExecutionManager {
    build: Arc<BuildManager>,
    inputs: Vec<String>,
    strategy: Box<dyn ExecutionStrategy>,
    status: RunStatus,
    trace: SharedTrace,
    duration: Duration,
    raises: bool,
    stream_compare: Option<bool>,
}

impl ExecutionManager {
    pub fn new(
        build: Arc<BuildManager>,
        inputs: Vec<String>,
        strategy: Box<dyn ExecutionStrategy>,
    ) -> Self {
        Self {
            build,
            inputs,
            strategy,
            status: RunStatus::NotStarted,
            trace: SharedTrace::new(),
            duration: Duration::ZERO,
            raises: false,
            stream_compare: None,
        }
    }

    /// Propagate failures as errors instead of classified test cases
    pub fn raising(mut self, raises: bool) -> Self {
        self.raises = raises;
        self
    }

    /// Override stream-compare mode for this run only
    pub fn with_stream_compare(mut self, stream_compare: Option<bool>) -> Self {
        self.stream_compare = stream_compare;
        self
    }

    pub fn build(&self) -> &Arc<BuildManager> {
        &self.build
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Duration of the run, zero until it finished
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Effective stream-compare mode: run override, then build option, then
    /// the language default
    pub fn stream_compare(&self) -> bool {
        self.stream_compare
            .or(self.build.options().stream_compare)
            .unwrap_or_else(|| self.strategy.default_stream_compare())
    }

    pub fn add_input(&mut self, input: impl Into<String>) -> Result<()> {
        if self.status != RunStatus::NotStarted {
            return Err(JudgeError::IllegalState(
                "cannot add inputs after the run started".to_string(),
            ));
        }
        self.inputs.push(input.into());
        Ok(())
    }

    pub fn add_inputs(&mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Result<()> {
        for input in inputs {
            self.add_input(input)?;
        }
        Ok(())
    }

    async fn check_runnable(&self) -> Result<()> {
        match self.status {
            RunStatus::Started => {
                return Err(JudgeError::IllegalState("run already started".to_string()))
            }
            RunStatus::Closed => {
                return Err(JudgeError::IllegalState(
                    "execution manager is closed".to_string(),
                ))
            }
            RunStatus::NotStarted => {}
        }
        if self.build.is_closed().await {
            return Err(JudgeError::IllegalState(
                "build manager is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn finish(&self, case: TestCase) -> Result<TestCase> {
        if self.raises {
            case.into_result()
        } else {
            Ok(case)
        }
    }

    /// Run the program once against the inputs
    pub async fn run(&mut self, timeout: Option<Duration>) -> Result<TestCase> {
        self.check_runnable().await?;
        check_timeout(timeout)?;

        let artifact = match self.build.build().await {
            Ok(artifact) => artifact,
            Err(JudgeError::Build(err)) => {
                self.status = RunStatus::Closed;
                return self.finish(TestCase::build_error(&err));
            }
            Err(err) => {
                self.status = RunStatus::Closed;
                return Err(err);
            }
        };

        let stream_compare = self.stream_compare();
        if !self.build.has_successful_execution() {
            self.build.log(
                LogLevel::Debug,
                format!(
                    "{}: executing program with {} inputs (stream_compare={})",
                    self.build.language(),
                    self.inputs.len(),
                    stream_compare
                ),
            );
        }

        let ctx = RunContext {
            build: self.build.clone(),
            artifact,
            inputs: self.inputs.clone(),
            timeout,
            stream_compare,
            trace: self.trace.clone(),
        };

        self.status = RunStatus::Started;
        let started = Instant::now();
        let supervised = timeout.map(|limit| limit + self.strategy.supervision_grace(limit));
        let result = with_timeout(supervised, self.strategy.interact(&ctx)).await;
        self.duration = started.elapsed();
        self.status = RunStatus::Closed;
        self.build.record_execution(self.duration);

        let mut case = match result {
            Ok(Ok(case)) => case,
            Ok(Err(JudgeError::Timeout(_))) | Err(JudgeError::Timeout(_)) => {
                TestCase::timeout(self.trace.snapshot(), timeout)
            }
            Ok(Err(err)) | Err(err) => TestCase::from_error(err, self.trace.snapshot())?,
        };

        if self.build.mark_successful_execution() {
            self.build.log(
                LogLevel::Debug,
                format!("{}: first run finished ({})", self.build.language(), case.outcome),
            );
        }

        case.strip_trailing_newline();
        self.finish(case)
    }

    /// Run the program attached to the real terminal. No trace is kept.
    pub async fn run_interactive(&mut self) -> Result<()> {
        self.check_runnable().await?;
        let artifact = self.build.build().await?;

        self.status = RunStatus::Started;
        let started = Instant::now();
        let result = self.strategy.interact_with_user(&self.build, artifact).await;
        self.duration = started.elapsed();
        self.status = RunStatus::Closed;
        self.build.record_execution(self.duration);
        result
    }

    /// Trace recorded so far
    pub fn trace(&self) -> crate::trace::Trace {
        self.trace.snapshot()
    }

    /// Close without running. Idempotent.
    pub fn close(&mut self) {
        self.status = RunStatus::Closed;
    }
}
