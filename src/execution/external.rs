//! Execution strategy for programs run as child processes
//!
//! Two modes:
//! - fine-grained: the interaction protocol records each input and the
//!   output between inputs
//! - stream-compare: all inputs are fed at once and only the whole input
//!   and output streams are recorded

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExecutionStrategy, RunContext};
use crate::build::{Artifact, BuildManager, ExternalArtifact, LogLevel};
use crate::error::{JudgeError, Result};
use crate::interact::pipe::PipeProcess;
use crate::interact::{drive, signal_name, ExitReport};
use crate::isolation::with_timeout;
use crate::languages::{CommandVars, LanguageConfig, EXECUTABLE_NAME};
use crate::trace::TestCase;

#[derive(Debug, Clone)]
pub struct ExternalExecution {
    config: Arc<LanguageConfig>,
    env: Option<Vec<(String, String)>>,
}

impl ExternalExecution {
    pub fn new(config: Arc<LanguageConfig>) -> Self {
        Self { config, env: None }
    }

    /// Replace the program's environment entirely
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = Some(env);
        self
    }

    fn argv(&self, artifact: &ExternalArtifact) -> Vec<String> {
        let vars = CommandVars {
            dir: artifact.dir(),
            source: &artifact.source_file,
            exe: EXECUTABLE_NAME,
        };
        LanguageConfig::expand(&self.config.run_command, &vars)
    }

    async fn fine_grained(&self, ctx: &RunContext, artifact: &ExternalArtifact) -> Result<TestCase> {
        let argv = self.argv(artifact);
        if !ctx.build.has_successful_execution() {
            ctx.build
                .log(LogLevel::Debug, format!("running {:?} step by step", argv));
        }
        let mut process = PipeProcess::spawn(&argv, artifact.dir(), ctx.timeout, self.env.as_deref())?;
        drive(&mut process, &ctx.inputs, &ctx.trace).await
    }

    async fn stream_compare(&self, ctx: &RunContext, artifact: &ExternalArtifact) -> Result<TestCase> {
        let argv = self.argv(artifact);
        if !ctx.build.has_successful_execution() {
            ctx.build
                .log(LogLevel::Debug, format!("running {:?} in stream-compare mode", argv));
        }
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| JudgeError::Config("empty run command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(artifact.dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &self.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                JudgeError::Config(format!("program not found: {}", program))
            } else {
                JudgeError::Io(e)
            }
        })?;

        let feed = if ctx.inputs.is_empty() {
            String::new()
        } else {
            format!("{}\n", ctx.inputs.join("\n"))
        };
        if let Some(mut stdin) = child.stdin.take() {
            let data = feed.clone();
            tokio::spawn(async move {
                // The program may legitimately stop reading early.
                if let Err(e) = stdin.write_all(data.as_bytes()).await {
                    debug!("stream-compare input not fully consumed: {}", e);
                }
            });
        }

        let output = with_timeout(ctx.timeout, child.wait_with_output()).await??;

        if !ctx.inputs.is_empty() {
            ctx.trace.push_input(&ctx.inputs.join("\n"));
        }
        ctx.trace.push_output(&String::from_utf8_lossy(&output.stdout));

        let report = ExitReport {
            code: output.status.code(),
            signal: output.status.signal().map(signal_name),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if report.success() {
            Ok(TestCase::success(ctx.trace.snapshot()))
        } else {
            Ok(TestCase::runtime_error(ctx.trace.snapshot(), report.describe()))
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ExternalExecution {
    fn default_stream_compare(&self) -> bool {
        self.config.stream_compare
    }

    async fn interact(&self, ctx: &RunContext) -> Result<TestCase> {
        let artifact = ctx.artifact.as_external()?;
        if ctx.stream_compare {
            self.stream_compare(ctx, artifact).await
        } else {
            self.fine_grained(ctx, artifact).await
        }
    }

    async fn interact_with_user(&self, _build: &BuildManager, artifact: Arc<Artifact>) -> Result<()> {
        let artifact = artifact.as_external()?;
        let argv = self.argv(artifact);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| JudgeError::Config("empty run command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(artifact.dir());
        if let Some(env) = &self.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        let status = cmd.status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(JudgeError::Runtime(format!(
                "{:?} executed with error: {}",
                argv, status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::external::ExternalBuild;
    use crate::build::BuildOptions;
    use crate::execution::ExecutionManager;
    use crate::languages::Strategy;
    use crate::trace::{Node, Outcome};
    use std::time::{Duration, Instant};

    fn shell_language(stream_compare: bool) -> Arc<LanguageConfig> {
        Arc::new(LanguageConfig {
            name: "sh".to_string(),
            description: "POSIX shell".to_string(),
            strategy: Strategy::External,
            source_ext: "sh".to_string(),
            check_command: None,
            compile_command: None,
            run_command: vec!["sh".to_string(), "{dir}/{source}".to_string()],
            stream_compare,
            extensions: vec!["sh".to_string()],
            aliases: Vec::new(),
        })
    }

    fn manager(source: &str, inputs: &[&str], stream_compare: bool) -> ExecutionManager {
        let config = shell_language(stream_compare);
        let build = BuildManager::new(
            "sh",
            source,
            BuildOptions::default(),
            Box::new(ExternalBuild::new(config.clone())),
        );
        ExecutionManager::new(
            build,
            inputs.iter().map(|s| s.to_string()).collect(),
            Box::new(ExternalExecution::new(config)),
        )
    }

    const ECHO: &str = "read a\nread b\necho \"$a $b\"\n";

    #[tokio::test]
    async fn test_fine_grained_echo() {
        let mut run = manager(ECHO, &["a", "b"], false);
        let case = run.run(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(case.outcome, Outcome::Success);
        assert_eq!(
            case.nodes,
            vec![
                Node::In("a".into()),
                Node::In("b".into()),
                Node::Out("a b".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_compare_records_two_nodes() {
        let mut run = manager(ECHO, &["a", "b"], true);
        assert!(run.stream_compare());
        let case = run.run(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(case.outcome, Outcome::Success);
        assert_eq!(
            case.nodes,
            vec![Node::In("a\nb".into()), Node::Out("a b".into())]
        );
    }

    #[tokio::test]
    async fn test_early_termination() {
        let mut run = manager("read a\necho $a\n", &["1", "2", "3"], false);
        let case = run.run(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(case.outcome, Outcome::EarlyTermination);
        assert_eq!(case.unused_inputs, vec!["2".to_string(), "3".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_trace() {
        let mut run = manager("echo started\nwhile :; do :; done\n", &[], false);
        let limit = Duration::from_millis(100);
        let started = Instant::now();
        let case = run.run(Some(limit)).await.unwrap();
        assert!(started.elapsed() < limit * 3 / 2);
        assert_eq!(case.outcome, Outcome::Timeout);
        assert_eq!(case.nodes, vec![Node::Out("started".into())]);
    }

    #[tokio::test]
    async fn test_stream_compare_timeout() {
        let mut run = manager("while :; do :; done\n", &["x"], true);
        let case = run.run(Some(Duration::from_millis(100))).await.unwrap();
        assert_eq!(case.outcome, Outcome::Timeout);
    }

    #[tokio::test]
    async fn test_stream_compare_names_signal() {
        let mut run = manager("kill -SEGV $$\n", &[], true);
        let case = run.run(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(case.outcome, Outcome::RuntimeError);
        assert_eq!(
            case.message.as_deref(),
            Some("Program terminated by signal SIGSEGV")
        );
    }

    #[tokio::test]
    async fn test_fine_grained_names_signal() {
        let mut run = manager("kill -SEGV $$\n", &[], false);
        let case = run.run(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(
            case.message.as_deref(),
            Some("Program terminated by signal SIGSEGV")
        );
    }

    #[tokio::test]
    async fn test_stream_compare_non_zero_exit() {
        let mut run = manager("cat\nexit 1\n", &["x"], true);
        let case = run.run(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(case.outcome, Outcome::RuntimeError);
        assert_eq!(case.nodes, vec![Node::In("x".into()), Node::Out("x".into())]);
    }
}
