//! Child process behind pipes, with pause detection

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::str;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{signal_name, ExitReport, ProcessHandle, SendError};
use crate::config::get_config;
use crate::error::{JudgeError, Result};
use crate::trace::SharedTrace;

/// Largest stderr tail kept for diagnostics
const STDERR_LIMIT: usize = 64 * 1024;

/// A spawned program talking through pipes
pub struct PipeProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    stdout_closed: bool,
    /// Bytes of a UTF-8 sequence split across reads
    partial: Vec<u8>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    settle_time: Duration,
    output_budget: usize,
}

impl PipeProcess {
    /// Spawn `argv` in `cwd`. With `env`, the environment is replaced
    /// entirely. The child is killed if the handle is dropped.
    pub fn spawn(
        argv: &[String],
        cwd: &Path,
        timeout: Option<Duration>,
        env: Option<&[(String, String)]>,
    ) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| JudgeError::Config("empty run command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
        debug!("Spawned {:?} (pid {:?})", argv, child.id());

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JudgeError::Protocol("child stdout was not captured".to_string()))?;
        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            buffer.extend_from_slice(&chunk[..n]);
                            if buffer.len() > STDERR_LIMIT {
                                let excess = buffer.len() - STDERR_LIMIT;
                                buffer.drain(..excess);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&buffer).into_owned()
            })
        });

        let config = get_config();
        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            stdout_closed: false,
            partial: Vec::new(),
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            settle_time: config.settle_time,
            output_budget: config.max_output_bytes,
        })
    }

    fn timed_out(&self) -> JudgeError {
        JudgeError::Timeout(self.timeout.unwrap_or_default())
    }

    /// Time left before the deadline, capped at `cap`
    fn remaining(&self, cap: Option<Duration>) -> Option<Duration> {
        let left = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (left, cap) {
            (Some(left), Some(cap)) => Some(left.min(cap)),
            (left, None) => left,
            (None, cap) => cap,
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Whether the kernel reports the process as runnable
    fn is_running(&self) -> bool {
        let Some(pid) = self.child.id() else {
            return false;
        };
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                // The state follows the parenthesised command name.
                let after_name = stat.rsplit_once(')')?.1;
                after_name.split_whitespace().next().map(|s| s == "R")
            })
            .unwrap_or(false)
    }

    /// Append a chunk of stdout to the trace, holding back an incomplete
    /// trailing UTF-8 sequence until the rest of it arrives.
    fn record(&mut self, trace: &SharedTrace, chunk: &[u8]) -> Result<()> {
        if chunk.len() > self.output_budget {
            self.flush(trace);
            return Err(JudgeError::Runtime(format!(
                "Output limit exceeded ({} bytes)",
                get_config().max_output_bytes
            )));
        }
        self.output_budget -= chunk.len();
        self.partial.extend_from_slice(chunk);

        let complete = match str::from_utf8(&self.partial) {
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => self.partial.len(),
        };
        let rest = self.partial.split_off(complete);
        trace.push_output(&String::from_utf8_lossy(&self.partial));
        self.partial = rest;
        Ok(())
    }

    /// Record whatever is held back, valid or not
    fn flush(&mut self, trace: &SharedTrace) {
        if !self.partial.is_empty() {
            trace.push_output(&String::from_utf8_lossy(&self.partial));
            self.partial.clear();
        }
    }

    async fn reap(&mut self) -> Result<std::process::ExitStatus> {
        let left = self.remaining(None);
        let timed_out = self.timed_out();
        let wait = self.child.wait();
        let status = match left {
            Some(left) => tokio::time::timeout(left, wait)
                .await
                .map_err(|_| timed_out)?,
            None => wait.await,
        };
        status.map_err(|e| JudgeError::Protocol(format!("failed to reap child process: {}", e)))
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> JudgeError {
    if err.kind() == std::io::ErrorKind::NotFound {
        JudgeError::Config(format!("program not found: {}", program))
    } else {
        JudgeError::Io(err)
    }
}

#[async_trait]
impl ProcessHandle for PipeProcess {
    async fn send(&mut self, text: &str) -> std::result::Result<(), SendError> {
        if self.deadline_passed() {
            return Err(SendError::TimedOut(self.timeout.unwrap_or_default()));
        }
        if self.stdout_closed {
            // Give a process that closed its output a moment to be reaped.
            let grace = self.settle_time;
            let _ = tokio::time::timeout(grace, self.child.wait()).await;
        }
        if !self.is_alive() {
            return Err(SendError::Exited);
        }
        let stdin = self.stdin.as_mut().ok_or(SendError::Exited)?;
        let line = format!("{}\n", text);
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        written.await.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => SendError::Exited,
            _ => SendError::Io(e),
        })
    }

    async fn receive(&mut self, trace: &SharedTrace) -> Result<()> {
        if self.stdout_closed {
            return Ok(());
        }

        let mut chunk = [0u8; 4096];
        loop {
            let wait = self.remaining(Some(self.settle_time)).unwrap_or(self.settle_time);
            match tokio::time::timeout(wait, self.stdout.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    self.stdout_closed = true;
                    self.flush(trace);
                    return Ok(());
                }
                Ok(Ok(n)) => self.record(trace, &chunk[..n])?,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    if self.deadline_passed() {
                        self.flush(trace);
                        return Err(self.timed_out());
                    }
                    if !self.is_running() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn finish(&mut self, trace: &SharedTrace) -> Result<ExitReport> {
        drop(self.stdin.take());

        if !self.stdout_closed {
            let mut chunk = [0u8; 4096];
            loop {
                let left = self.remaining(None);
                let read = self.stdout.read(&mut chunk);
                let n = match left {
                    Some(left) => match tokio::time::timeout(left, read).await {
                        Ok(n) => n?,
                        Err(_) => {
                            self.flush(trace);
                            return Err(self.timed_out());
                        }
                    },
                    None => read.await?,
                };
                if n == 0 {
                    self.stdout_closed = true;
                    self.flush(trace);
                    break;
                }
                self.record(trace, &chunk[..n])?;
            }
        }

        let status = self.reap().await?;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(ExitReport {
            code: status.code(),
            signal: status.signal().map(signal_name),
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interact::drive;
    use crate::trace::{Node, Outcome, SharedTrace};
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn inputs(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_echo_dialogue() {
        let dir = TempDir::new().unwrap();
        let script = "printf 'first: '; read a; printf 'second: '; read b; echo \"$a $b\"";
        let mut process =
            PipeProcess::spawn(&sh(script), dir.path(), Some(Duration::from_secs(5)), None).unwrap();
        let trace = SharedTrace::new();
        let case = drive(&mut process, &inputs(&["a", "b"]), &trace).await.unwrap();
        assert_eq!(case.outcome, Outcome::Success);
        assert_eq!(
            case.nodes,
            vec![
                Node::Out("first: ".into()),
                Node::In("a".into()),
                Node::Out("second: ".into()),
                Node::In("b".into()),
                Node::Out("a b\n".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_early_exit_lists_unused_inputs() {
        let dir = TempDir::new().unwrap();
        let mut process =
            PipeProcess::spawn(&sh("read a; echo got $a"), dir.path(), Some(Duration::from_secs(5)), None)
                .unwrap();
        let trace = SharedTrace::new();
        let case = drive(&mut process, &inputs(&["1", "2", "3"]), &trace)
            .await
            .unwrap();
        assert_eq!(case.outcome, Outcome::EarlyTermination);
        assert_eq!(case.unused_inputs, inputs(&["2", "3"]));
    }

    #[tokio::test]
    async fn test_receive_times_out_on_busy_process() {
        let dir = TempDir::new().unwrap();
        let limit = Duration::from_millis(100);
        let started = std::time::Instant::now();
        let mut process =
            PipeProcess::spawn(&sh("while :; do :; done"), dir.path(), Some(limit), None).unwrap();
        let err = process.receive(&SharedTrace::new()).await.unwrap_err();
        assert!(matches!(err, JudgeError::Timeout(l) if l == limit));
        assert!(started.elapsed() < limit * 3 / 2);
    }

    #[tokio::test]
    async fn test_output_survives_outer_cancellation() {
        let dir = TempDir::new().unwrap();
        // No deadline of its own: only the outer timer can stop it.
        let mut process =
            PipeProcess::spawn(&sh("echo started; while :; do :; done"), dir.path(), None, None)
                .unwrap();
        let trace = SharedTrace::new();
        let outer = tokio::time::timeout(
            Duration::from_millis(300),
            drive(&mut process, &[], &trace),
        )
        .await;
        assert!(outer.is_err());
        assert_eq!(trace.snapshot().nodes(), &[Node::Out("started\n".into())]);
    }

    #[tokio::test]
    async fn test_multibyte_output_is_kept_whole() {
        let dir = TempDir::new().unwrap();
        let mut process = PipeProcess::spawn(
            &sh("printf '\\303'; sleep 0.2; printf '\\251t\\351\\n'"),
            dir.path(),
            Some(Duration::from_secs(5)),
            None,
        )
        .unwrap();
        let trace = SharedTrace::new();
        let case = drive(&mut process, &[], &trace).await.unwrap();
        assert_eq!(case.nodes, vec![Node::Out("\u{e9}t\u{fffd}\n".into())]);
    }

    #[tokio::test]
    async fn test_crash_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let mut process =
            PipeProcess::spawn(&sh("echo broken >&2; exit 4"), dir.path(), Some(Duration::from_secs(5)), None)
                .unwrap();
        let trace = SharedTrace::new();
        let case = drive(&mut process, &[], &trace).await.unwrap();
        assert_eq!(case.outcome, Outcome::RuntimeError);
        assert_eq!(
            case.message.as_deref(),
            Some("Program exited with status 4\nbroken")
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_config_error() {
        let dir = TempDir::new().unwrap();
        let argv = vec!["ejudge-no-such-program".to_string()];
        let result = PipeProcess::spawn(&argv, dir.path(), None, None);
        assert!(matches!(result, Err(JudgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_environment_is_replaced() {
        let dir = TempDir::new().unwrap();
        let env = vec![
            ("PATH".to_string(), std::env::var("PATH").unwrap_or_default()),
            ("GREETING".to_string(), "hello".to_string()),
        ];
        let mut process = PipeProcess::spawn(
            &sh("echo $GREETING ${HOME:-nohome}"),
            dir.path(),
            Some(Duration::from_secs(5)),
            Some(&env),
        )
        .unwrap();
        let trace = SharedTrace::new();
        let case = drive(&mut process, &[], &trace).await.unwrap();
        assert_eq!(case.nodes, vec![Node::Out("hello nohome\n".into())]);
    }
}
