//! Build module - turns source code into a runnable artifact
//!
//! A [`BuildManager`] owns one source string and at most one build attempt:
//! - `build()` validates syntax, then runs the language's preparation step
//! - the artifact is cached and shared by every run of the same build
//! - a failed build keeps reporting the same [`BuildError`]
//! - `close()` releases the artifact (and its temp directory)
//!
//! The build module does NOT:
//! - Feed inputs to programs or record traces
//! - Enforce run time limits

pub mod external;
pub mod in_process;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::error::{BuildError, JudgeError, Result};
use crate::script::CompiledScript;

/// Capability every isolated context must provide
pub const BASE_CAPABILITY: &str = "ejudge";

/// Version of the serialized [`BuildSummary`] layout
pub const SUMMARY_VERSION: u32 = 1;

/// Options accepted by a build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Harden file permissions for a restricted identity
    #[serde(default)]
    pub sandboxed: bool,
    /// Extra capabilities the program needs from an isolated context
    #[serde(default)]
    pub extra_modules: Vec<String>,
    /// Override the language's default stream-compare mode
    #[serde(default)]
    pub stream_compare: Option<bool>,
    /// Read-only names seeded into in-process programs
    #[serde(default)]
    pub globals: BTreeMap<String, String>,
    /// Mutable names seeded into in-process programs
    #[serde(default)]
    pub locals: BTreeMap<String, String>,
}

impl BuildOptions {
    pub fn sandboxed(mut self, sandboxed: bool) -> Self {
        self.sandboxed = sandboxed;
        self
    }

    pub fn with_stream_compare(mut self, stream_compare: Option<bool>) -> Self {
        self.stream_compare = stream_compare;
        self
    }

    pub fn with_extra_modules(mut self, modules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_modules = modules.into_iter().map(|m| m.into()).collect();
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.globals.insert(name.into(), value.into());
        self
    }
}

/// Build directory of an external language
#[derive(Debug)]
pub struct ExternalArtifact {
    pub(crate) dir: TempDir,
    pub source_file: String,
    pub executable: Option<PathBuf>,
}

impl ExternalArtifact {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.path().join(&self.source_file)
    }
}

/// Product of a successful build
#[derive(Debug)]
pub enum Artifact {
    InProcess(CompiledScript),
    External(ExternalArtifact),
}

impl Artifact {
    pub fn as_script(&self) -> Result<&CompiledScript> {
        match self {
            Artifact::InProcess(script) => Ok(script),
            Artifact::External(_) => Err(JudgeError::IllegalState(
                "expected an in-process artifact".to_string(),
            )),
        }
    }

    pub fn as_external(&self) -> Result<&ExternalArtifact> {
        match self {
            Artifact::External(artifact) => Ok(artifact),
            Artifact::InProcess(_) => Err(JudgeError::IllegalState(
                "expected an external artifact".to_string(),
            )),
        }
    }
}

/// Language-specific build behaviour
#[async_trait]
pub trait BuildStrategy: fmt::Debug + Send + Sync {
    /// Cheap validation run before anything else; Err carries the diagnostic
    fn syntax_check(&self, source: &str) -> std::result::Result<(), String>;

    /// Produce the artifact for an already validated program
    async fn prepare(&self, build: &BuildManager) -> Result<Artifact>;

    /// Capability names this strategy needs in an isolated context
    fn capabilities(&self) -> Vec<String>;
}

/// Lifecycle state of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Unbuilt,
    Built,
    Failed,
    Closed,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Unbuilt => "unbuilt",
            BuildStatus::Built => "built",
            BuildStatus::Failed => "failed",
            BuildStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
enum BuildState {
    Unbuilt,
    Built(Arc<Artifact>),
    Failed(BuildError),
    /// Keeps the build error for summaries taken after closing
    Closed(Option<BuildError>),
}

impl BuildState {
    fn status(&self) -> BuildStatus {
        match self {
            BuildState::Unbuilt => BuildStatus::Unbuilt,
            BuildState::Built(_) => BuildStatus::Built,
            BuildState::Failed(_) => BuildStatus::Failed,
            BuildState::Closed(_) => BuildStatus::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Diagnostic message attached to a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    /// Emit through `tracing`
    pub fn emit(&self) {
        match self.level {
            LogLevel::Debug => debug!("{}", self.message),
            LogLevel::Info => info!("{}", self.message),
            LogLevel::Warn => warn!("{}", self.message),
            LogLevel::Error => error!("{}", self.message),
        }
    }
}

/// Serializable snapshot of a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub version: u32,
    pub language: String,
    pub status: BuildStatus,
    pub sandboxed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub build_duration_us: u64,
    pub execution_duration_us: u64,
    pub has_successful_execution: bool,
    #[serde(default)]
    pub messages: Vec<LogRecord>,
}

/// Owns one source string and its build artifact
#[derive(Debug)]
pub struct BuildManager {
    language: String,
    source: String,
    options: BuildOptions,
    strategy: Box<dyn BuildStrategy>,
    state: AsyncMutex<BuildState>,
    build_duration_us: AtomicU64,
    execution_duration_ns: AtomicU64,
    has_successful_execution: AtomicBool,
    messages: Mutex<Vec<LogRecord>>,
}

impl BuildManager {
    pub fn new(
        language: impl Into<String>,
        source: impl Into<String>,
        options: BuildOptions,
        strategy: Box<dyn BuildStrategy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            language: language.into(),
            source: source.into(),
            options,
            strategy,
            state: AsyncMutex::new(BuildState::Unbuilt),
            build_duration_us: AtomicU64::new(0),
            execution_duration_ns: AtomicU64::new(0),
            has_successful_execution: AtomicBool::new(false),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn is_sandboxed(&self) -> bool {
        self.options.sandboxed
    }

    /// Capability names an isolated context must provide to rebuild this
    pub fn required_capabilities(&self) -> Vec<String> {
        let mut capabilities = vec![BASE_CAPABILITY.to_string()];
        capabilities.extend(self.strategy.capabilities());
        capabilities.extend(self.options.extra_modules.iter().cloned());
        capabilities.dedup();
        capabilities
    }

    /// Build once; later calls return the cached artifact or the same error
    pub async fn build(&self) -> Result<Arc<Artifact>> {
        let mut state = self.state.lock().await;
        match &*state {
            BuildState::Built(artifact) => return Ok(artifact.clone()),
            BuildState::Failed(err) => return Err(err.clone().into()),
            BuildState::Closed(_) => {
                return Err(JudgeError::IllegalState(
                    "build manager is closed".to_string(),
                ))
            }
            BuildState::Unbuilt => {}
        }

        let started = Instant::now();

        if let Err(diagnostic) = self.strategy.syntax_check(&self.source) {
            self.log(LogLevel::Debug, format!("{}: invalid syntax", self.language));
            let err = BuildError::new(diagnostic);
            *state = BuildState::Failed(err.clone());
            return Err(err.into());
        }

        match self.strategy.prepare(self).await {
            Ok(artifact) => {
                let elapsed = started.elapsed();
                self.build_duration_us
                    .store(elapsed.as_micros() as u64, Ordering::SeqCst);
                self.log(
                    LogLevel::Info,
                    format!(
                        "{}: successfully built ({:.3} sec)",
                        self.language,
                        elapsed.as_secs_f64()
                    ),
                );
                let artifact = Arc::new(artifact);
                *state = BuildState::Built(artifact.clone());
                Ok(artifact)
            }
            Err(JudgeError::Build(err)) => {
                self.log(LogLevel::Debug, format!("{}: build failed", self.language));
                *state = BuildState::Failed(err.clone());
                Err(err.into())
            }
            Err(other) => {
                self.log(
                    LogLevel::Error,
                    format!("{}: build aborted: {}", self.language, other),
                );
                *state = BuildState::Failed(BuildError::new(other.to_string()));
                Err(other)
            }
        }
    }

    /// Release the artifact. Calling it again does nothing.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let error = match &*state {
            BuildState::Closed(_) => return,
            BuildState::Failed(err) => Some(err.clone()),
            _ => None,
        };
        debug!("{}: closing build manager", self.language);
        *state = BuildState::Closed(error);
    }

    pub async fn status(&self) -> BuildStatus {
        self.state.lock().await.status()
    }

    pub async fn is_closed(&self) -> bool {
        self.status().await == BuildStatus::Closed
    }

    /// The build error, if the build failed. Survives closing.
    pub async fn error(&self) -> Option<BuildError> {
        match &*self.state.lock().await {
            BuildState::Failed(err) | BuildState::Closed(Some(err)) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn build_duration(&self) -> Duration {
        Duration::from_micros(self.build_duration_us.load(Ordering::SeqCst))
    }

    /// Total time spent by all runs sharing this build
    pub fn execution_duration(&self) -> Duration {
        Duration::from_nanos(self.execution_duration_ns.load(Ordering::SeqCst))
    }

    pub(crate) fn record_execution(&self, duration: Duration) {
        self.execution_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn has_successful_execution(&self) -> bool {
        self.has_successful_execution.load(Ordering::SeqCst)
    }

    /// Flag a completed run; true only for the first one
    pub(crate) fn mark_successful_execution(&self) -> bool {
        !self.has_successful_execution.swap(true, Ordering::SeqCst)
    }

    /// Record a diagnostic. Sandboxed builds buffer messages so the parent
    /// can replay them; other builds log immediately.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let record = LogRecord {
            level,
            message: message.into(),
        };
        if !self.options.sandboxed {
            record.emit();
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    pub fn messages(&self) -> Vec<LogRecord> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn summary(&self) -> BuildSummary {
        let state = self.state.lock().await;
        BuildSummary {
            version: SUMMARY_VERSION,
            language: self.language.clone(),
            status: state.status(),
            sandboxed: self.options.sandboxed,
            error: match &*state {
                BuildState::Failed(err) | BuildState::Closed(Some(err)) => Some(err.message.clone()),
                _ => None,
            },
            build_duration_us: self.build_duration_us.load(Ordering::SeqCst),
            execution_duration_us: self.execution_duration().as_micros() as u64,
            has_successful_execution: self.has_successful_execution(),
            messages: self.messages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingStrategy {
        prepared: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BuildStrategy for CountingStrategy {
        fn syntax_check(&self, source: &str) -> std::result::Result<(), String> {
            if source.contains("syntax error") {
                Err("bad syntax".to_string())
            } else {
                Ok(())
            }
        }

        async fn prepare(&self, build: &BuildManager) -> Result<Artifact> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            if build.source().contains("link error") {
                return Err(BuildError::new("undefined reference").into());
            }
            Ok(Artifact::InProcess(CompiledScript {
                ast: crate::script::compile("1").map_err(BuildError::new)?,
                globals: BTreeMap::new(),
                locals: BTreeMap::new(),
            }))
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["ejudge.test".to_string()]
        }
    }

    fn manager(source: &str) -> (Arc<BuildManager>, Arc<AtomicUsize>) {
        let prepared = Arc::new(AtomicUsize::new(0));
        let strategy = CountingStrategy {
            prepared: prepared.clone(),
        };
        let build = BuildManager::new("test", source, BuildOptions::default(), Box::new(strategy));
        (build, prepared)
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let (build, prepared) = manager("ok");
        let first = build.build().await.unwrap();
        let second = build.build().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        assert_eq!(build.status().await, BuildStatus::Built);
    }

    #[tokio::test]
    async fn test_syntax_failure_is_terminal() {
        let (build, prepared) = manager("syntax error");
        let first = build.build().await.unwrap_err();
        let second = build.build().await.unwrap_err();
        assert!(matches!(first, JudgeError::Build(ref e) if e.message == "bad syntax"));
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(prepared.load(Ordering::SeqCst), 0);
        assert_eq!(build.status().await, BuildStatus::Failed);
        assert_eq!(build.execution_duration(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_prepare_failure_is_terminal() {
        let (build, prepared) = manager("link error");
        assert!(build.build().await.is_err());
        assert!(build.build().await.is_err());
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        assert_eq!(
            build.error().await,
            Some(BuildError::new("undefined reference"))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (build, _) = manager("ok");
        build.build().await.unwrap();
        build.close().await;
        build.close().await;
        assert!(build.is_closed().await);
        assert!(matches!(
            build.build().await,
            Err(JudgeError::IllegalState(_))
        ));
    }

    #[test]
    fn test_required_capabilities() {
        let (build, _) = manager("ok");
        assert_eq!(
            build.required_capabilities(),
            vec!["ejudge".to_string(), "ejudge.test".to_string()]
        );
    }

    #[test]
    fn test_first_successful_execution_flag() {
        let (build, _) = manager("ok");
        assert!(!build.has_successful_execution());
        assert!(build.mark_successful_execution());
        assert!(!build.mark_successful_execution());
        assert!(build.has_successful_execution());
    }

    #[tokio::test]
    async fn test_summary_serializes() {
        let (build, _) = manager("syntax error");
        let _ = build.build().await;
        let summary = build.summary().await;
        assert_eq!(summary.status, BuildStatus::Failed);
        assert_eq!(summary.error.as_deref(), Some("bad syntax"));
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["version"], SUMMARY_VERSION);
    }

    #[tokio::test]
    async fn test_closed_summary_keeps_build_error() {
        let (build, _) = manager("syntax error");
        let _ = build.build().await;
        build.close().await;
        let summary = build.summary().await;
        assert_eq!(summary.status, BuildStatus::Closed);
        assert_eq!(summary.error.as_deref(), Some("bad syntax"));
        assert_eq!(build.error().await.map(|e| e.message), Some("bad syntax".to_string()));
    }
}
