//! Execution strategy for programs interpreted by the embedded engine
//!
//! Runs are delegated to an isolated worker process unless this process
//! already is one. Inside the worker the interpreter runs on a blocking
//! thread and is stopped through its cancel flag when the time is up.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionStrategy, RunContext};
use crate::build::{Artifact, BuildManager};
use crate::error::{JudgeError, Result};
use crate::isolation::worker::{IsolatedRequest, SandboxRunner, WorkerMode, WorkerSandbox};
use crate::isolation::{in_isolated_worker, run_blocking};
use crate::script::{self, ConsoleIo, ProgramIo, RecordingIo, ScriptFailure};
use crate::trace::TestCase;

/// Upper bound on the extra time a worker gets to report its own timeout
const MAX_WORKER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Delegate to a worker process unless already inside one
    Isolated,
    /// Always interpret in this process
    Direct,
}

#[derive(Debug, Clone)]
pub struct InProcessExecution {
    placement: Placement,
}

impl Default for InProcessExecution {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessExecution {
    pub fn new() -> Self {
        Self {
            placement: Placement::Isolated,
        }
    }

    /// Interpret in the calling process without spawning a worker
    pub fn direct() -> Self {
        Self {
            placement: Placement::Direct,
        }
    }

    fn delegates(&self) -> bool {
        self.placement == Placement::Isolated && !in_isolated_worker()
    }

    async fn interact_here(&self, ctx: &RunContext) -> Result<TestCase> {
        let artifact = ctx.artifact.clone();
        artifact.as_script()?;

        let io = Arc::new(RecordingIo::new(ctx.inputs.clone(), ctx.trace.clone()));
        let cancel = Arc::new(AtomicBool::new(false));
        let source = ctx.build.source().to_string();
        let job_cancel = cancel.clone();

        let outcome = run_blocking(ctx.timeout, cancel, move || {
            let script = artifact.as_script()?;
            Ok::<_, JudgeError>(script::run(script, io, Some(job_cancel), &source))
        })
        .await??;

        let trace = ctx.trace.snapshot();
        match outcome {
            Ok(()) => Ok(TestCase::success(trace)),
            Err(ScriptFailure::MissingInput(traceback)) | Err(ScriptFailure::Error(traceback)) => {
                Ok(TestCase::runtime_error(trace, traceback))
            }
            Err(ScriptFailure::Cancelled) => Err(JudgeError::Timeout(ctx.timeout.unwrap_or_default())),
        }
    }

    async fn interact_in_worker(&self, ctx: &RunContext) -> Result<TestCase> {
        let build = &ctx.build;
        debug!("{}: delegating run to isolated worker", build.language());

        let mut options = build.options().clone();
        options.stream_compare = Some(ctx.stream_compare);
        let request = IsolatedRequest::new(
            WorkerMode::Interact,
            build.language(),
            build.source(),
            vec![ctx.inputs.clone()],
            ctx.timeout,
            options,
            build.required_capabilities(),
        );

        let sandbox = WorkerSandbox::from_config(build.is_sandboxed())?;
        let response = sandbox.run_isolated(&request).await?;
        let report = response.into_report()?;

        let case = report
            .cases
            .into_iter()
            .next()
            .ok_or_else(|| JudgeError::Sandbox("worker returned no test case".to_string()))?;
        for node in &case.nodes {
            match node {
                crate::trace::Node::In(text) => ctx.trace.push_input(text),
                crate::trace::Node::Out(text) => ctx.trace.push_output(text),
            }
        }
        Ok(case)
    }
}

#[async_trait]
impl ExecutionStrategy for InProcessExecution {
    fn supervision_grace(&self, timeout: Duration) -> Duration {
        if self.delegates() {
            (timeout / 4).min(MAX_WORKER_GRACE)
        } else {
            Duration::ZERO
        }
    }

    async fn interact(&self, ctx: &RunContext) -> Result<TestCase> {
        if self.delegates() {
            self.interact_in_worker(ctx).await
        } else {
            self.interact_here(ctx).await
        }
    }

    async fn interact_with_user(&self, build: &BuildManager, artifact: Arc<Artifact>) -> Result<()> {
        artifact.as_script()?;
        let source = build.source().to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let io: Arc<dyn ProgramIo> = Arc::new(ConsoleIo);
            let script = artifact.as_script()?;
            Ok::<_, JudgeError>(script::run(script, io, None, &source))
        })
        .await
        .map_err(|e| JudgeError::Runtime(format!("interpreter crashed: {}", e)))??;

        match outcome {
            Ok(()) => Ok(()),
            Err(ScriptFailure::MissingInput(traceback)) | Err(ScriptFailure::Error(traceback)) => {
                Err(JudgeError::Runtime(traceback))
            }
            Err(ScriptFailure::Cancelled) => Err(JudgeError::Timeout(Duration::ZERO)),
        }
    }
}
