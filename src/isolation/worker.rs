//! Isolated worker - builds and runs inside a separate process
//!
//! The parent spawns `ejudge worker`, writes one JSON [`IsolatedRequest`]
//! to its stdin and reads one JSON [`IsolatedResponse`] from its stdout.
//! When started as root with a sandbox request, the worker runs under an
//! unprivileged identity.
//!
//! The worker does NOT:
//! - Keep state between requests (one request per process)
//! - Log to stdout (reserved for the response)

use std::path::PathBuf;
use std::sync::Arc;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use nix::unistd::{geteuid, User};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::build::{BuildManager, BuildOptions, LogRecord};
use crate::config::get_config;
use crate::error::{JudgeError, Result, WorkerError};
use crate::execution::RunContext;
use crate::isolation::{mark_isolated, with_timeout};
use crate::judge::{run_from_manager, RunOptions, RunReport, REPORT_VERSION};
use crate::registry::{registry, Registry};
use crate::trace::{SharedTrace, TestCase};

/// Subcommand that turns the binary into a worker
pub const WORKER_COMMAND: &str = "worker";

/// Version of the request/response layout
pub const WORKER_PROTOCOL_VERSION: u32 = 1;

/// What the worker should do with the program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Build and run every input set, with full run bookkeeping
    Run,
    /// Build and interact once; the parent does the bookkeeping
    Interact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedRequest {
    pub version: u32,
    pub mode: WorkerMode,
    pub language: String,
    pub source: String,
    pub input_sets: Vec<Vec<String>>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub raises: bool,
    #[serde(default)]
    pub options: BuildOptions,
    /// Capability names the worker must provide
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl IsolatedRequest {
    pub fn new(
        mode: WorkerMode,
        language: &str,
        source: &str,
        input_sets: Vec<Vec<String>>,
        timeout: Option<Duration>,
        options: BuildOptions,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            version: WORKER_PROTOCOL_VERSION,
            mode,
            language: language.to_string(),
            source: source.to_string(),
            input_sets,
            timeout_ms: timeout.map(ceil_millis),
            raises: false,
            options,
            capabilities,
        }
    }

    pub fn raising(mut self, raises: bool) -> Self {
        self.raises = raises;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Whole milliseconds, rounded up so a positive limit never becomes zero
fn ceil_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolatedResponse {
    pub version: u32,
    pub result: std::result::Result<RunReport, WorkerError>,
    /// Build messages buffered inside the worker
    #[serde(default)]
    pub messages: Vec<LogRecord>,
}

impl IsolatedResponse {
    /// Replay buffered messages, then unwrap the result
    pub fn into_report(self) -> Result<RunReport> {
        for record in &self.messages {
            record.emit();
        }
        self.result.map_err(JudgeError::from)
    }
}

/// Runs a request somewhere isolated from the caller
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run_isolated(&self, request: &IsolatedRequest) -> Result<IsolatedResponse>;
}

/// Runs requests in a freshly spawned worker process
#[derive(Debug, Clone)]
pub struct WorkerSandbox {
    program: PathBuf,
    /// Identity to assume when started as root
    user: Option<String>,
    env: Vec<(String, String)>,
}

impl WorkerSandbox {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            user: None,
            env: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Worker from the global configuration. `restricted` drops privileges.
    pub fn from_config(restricted: bool) -> Result<Self> {
        let config = get_config();
        let mut sandbox = Self::new(config.worker_program()?);
        if restricted {
            sandbox.user = Some(config.sandbox_user.clone());
        }
        sandbox.env = config.to_env();
        Ok(sandbox)
    }
}

/// uid/gid to run as, or None when not privileged to switch
fn restricted_identity(name: &str) -> Result<Option<(u32, u32)>> {
    if !geteuid().is_root() {
        debug!("Not running as root, worker keeps the current identity");
        return Ok(None);
    }
    let user = User::from_name(name)
        .map_err(|e| JudgeError::Sandbox(format!("cannot look up user {}: {}", name, e)))?
        .ok_or_else(|| JudgeError::Config(format!("unknown sandbox user: {}", name)))?;
    Ok(Some((user.uid.as_raw(), user.gid.as_raw())))
}

#[async_trait]
impl SandboxRunner for WorkerSandbox {
    async fn run_isolated(&self, request: &IsolatedRequest) -> Result<IsolatedResponse> {
        let body = serde_json::to_vec(request)
            .map_err(|e| JudgeError::Sandbox(format!("cannot encode request: {}", e)))?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(WORKER_COMMAND)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(user) = &self.user {
            if let Some((uid, gid)) = restricted_identity(user)? {
                debug!("Worker runs as {} ({}:{})", user, uid, gid);
                cmd.uid(uid).gid(gid);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            JudgeError::Sandbox(format!("cannot start worker {:?}: {}", self.program, e))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("Worker stderr:\n{}", stderr.trim_end());
        }
        if output.stdout.is_empty() {
            return Err(JudgeError::Sandbox(format!(
                "worker exited with {} without a response: {}",
                output.status,
                stderr.trim()
            )));
        }

        let response: IsolatedResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| JudgeError::Sandbox(format!("invalid worker response: {}", e)))?;
        if response.version != WORKER_PROTOCOL_VERSION {
            return Err(JudgeError::Sandbox(format!(
                "worker speaks protocol {}, expected {}",
                response.version, WORKER_PROTOCOL_VERSION
            )));
        }
        Ok(response)
    }
}

/// Worker side: read one request, answer it, exit
pub async fn serve<R, W>(mut input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    input
        .read_to_end(&mut raw)
        .await
        .context("Failed to read worker request")?;
    let request: IsolatedRequest =
        serde_json::from_slice(&raw).context("Failed to decode worker request")?;

    mark_isolated();
    let response = match registry() {
        Ok(registry) => answer(registry, &request).await,
        Err(err) => failure(err, Vec::new()),
    };

    let body = serde_json::to_vec(&response).context("Failed to encode worker response")?;
    output.write_all(&body).await?;
    output.flush().await?;
    Ok(())
}

/// Answer one request against `registry`
pub async fn answer(registry: &Registry, request: &IsolatedRequest) -> IsolatedResponse {
    let mut messages = Vec::new();
    match process(registry, request, &mut messages).await {
        Ok(report) => IsolatedResponse {
            version: WORKER_PROTOCOL_VERSION,
            result: Ok(report),
            messages,
        },
        Err(err) => failure(err, messages),
    }
}

fn failure(err: JudgeError, messages: Vec<LogRecord>) -> IsolatedResponse {
    if !err.is_user_failure() {
        warn!("Worker request failed: {}", err);
    }
    IsolatedResponse {
        version: WORKER_PROTOCOL_VERSION,
        result: Err(err.to_worker_error()),
        messages,
    }
}

async fn process(
    registry: &Registry,
    request: &IsolatedRequest,
    messages: &mut Vec<LogRecord>,
) -> Result<RunReport> {
    if request.version != WORKER_PROTOCOL_VERSION {
        return Err(JudgeError::Sandbox(format!(
            "unsupported request version {}",
            request.version
        )));
    }

    registry.ensure_capabilities(&request.capabilities)?;
    let build = registry.new_build_manager(
        &request.language,
        request.source.clone(),
        request.options.clone(),
    )?;

    let result = match request.mode {
        WorkerMode::Run => {
            let options = RunOptions {
                timeout: request.timeout(),
                sandbox: request.options.sandboxed,
                raises: request.raises,
                stream_compare: request.options.stream_compare,
                extra_modules: request.options.extra_modules.clone(),
            };
            run_from_manager(registry, &build, request.input_sets.clone(), &options).await
        }
        WorkerMode::Interact => interact_once(registry, &build, request).await,
    };

    if build.is_sandboxed() {
        messages.extend(build.messages());
    }
    result
}

async fn interact_once(
    registry: &Registry,
    build: &Arc<BuildManager>,
    request: &IsolatedRequest,
) -> Result<RunReport> {
    let artifact = build.build().await?;
    let strategy = registry.binding(build.language())?.execution_strategy();

    let timeout = request.timeout();
    let trace = SharedTrace::new();
    let ctx = RunContext {
        build: build.clone(),
        artifact,
        inputs: request.input_sets.first().cloned().unwrap_or_default(),
        timeout,
        stream_compare: request
            .options
            .stream_compare
            .unwrap_or_else(|| strategy.default_stream_compare()),
        trace: trace.clone(),
    };

    let case = match with_timeout(timeout, strategy.interact(&ctx)).await {
        Ok(Ok(case)) => case,
        Ok(Err(JudgeError::Timeout(_))) | Err(JudgeError::Timeout(_)) => {
            TestCase::timeout(trace.snapshot(), timeout)
        }
        Ok(Err(err)) | Err(err) => TestCase::from_error(err, trace.snapshot())?,
    };
    drop(ctx);

    build.close().await;
    let summary = build.summary().await;
    Ok(RunReport {
        version: REPORT_VERSION,
        language: build.language().to_string(),
        build: summary,
        cases: vec![case],
    })
}
