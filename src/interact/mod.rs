//! Interaction protocol - step-by-step dialogue with a live process
//!
//! The protocol only needs four primitives from a process handle:
//! `send`, `receive`, `is_alive` and `finish`. [`pipe::PipeProcess`]
//! provides them for real child processes.

pub mod pipe;

use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use thiserror::Error;

use crate::error::{JudgeError, Result};
use crate::trace::{SharedTrace, TestCase};

/// Why an input could not be delivered
#[derive(Debug, Error)]
pub enum SendError {
    #[error("process has already exited")]
    Exited,
    #[error("time limit reached before the input could be sent")]
    TimedOut(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// Terminating signal name, if killed by one
    pub signal: Option<String>,
    pub stderr: String,
}

/// `SIGSEGV` style name of a signal number
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => signal.to_string(),
    }
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Diagnostic for an unsuccessful exit
    pub fn describe(&self) -> String {
        let mut message = match (&self.signal, self.code) {
            (Some(signal), _) => format!("Program terminated by signal {}", signal),
            (None, Some(code)) => format!("Program exited with status {}", code),
            (None, None) => "Program exited abnormally".to_string(),
        };
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            message.push('\n');
            message.push_str(stderr);
        }
        message
    }
}

/// A running process the protocol can talk to
#[async_trait]
pub trait ProcessHandle: Send {
    /// Deliver one line of input
    async fn send(&mut self, text: &str) -> std::result::Result<(), SendError>;

    /// Record output into `trace` until the process pauses or stops
    /// producing it. Output is recorded as soon as it is read, so it
    /// survives this future being dropped.
    async fn receive(&mut self, trace: &SharedTrace) -> Result<()>;

    fn is_alive(&mut self) -> bool;

    /// Close input, record what is left and reap the process
    async fn finish(&mut self, trace: &SharedTrace) -> Result<ExitReport>;
}

/// Drive `handle` through `inputs`, appending every step to `trace`.
///
/// User-level failures come back as classified test cases. Errors are
/// reserved for timeouts and internal failures.
pub async fn drive<H>(handle: &mut H, inputs: &[String], trace: &SharedTrace) -> Result<TestCase>
where
    H: ProcessHandle + ?Sized,
{
    handle.receive(trace).await?;

    for (idx, input) in inputs.iter().enumerate() {
        if let Err(err) = handle.send(input).await {
            if let SendError::TimedOut(limit) = err {
                return Err(JudgeError::Timeout(limit));
            }
            if matches!(err, SendError::Exited) || !handle.is_alive() {
                // Reap so no zombie is left behind; the outcome is already known.
                let _ = handle.finish(trace).await;
                return Ok(TestCase::early_termination(
                    trace.snapshot(),
                    inputs[idx..].to_vec(),
                ));
            }
            return Ok(TestCase::runtime_error(
                trace.snapshot(),
                format!(
                    "An internal error occurred while trying to interact with the program: {}",
                    err
                ),
            ));
        }
        trace.push_input(input);
        handle.receive(trace).await?;
    }

    let report = handle.finish(trace).await?;

    if report.success() {
        Ok(TestCase::success(trace.snapshot()))
    } else {
        Ok(TestCase::runtime_error(trace.snapshot(), report.describe()))
    }
}
