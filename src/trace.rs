//! Interaction traces
//!
//! A trace is the ordered record of what a program printed and what it was
//! fed. A [`TestCase`] is a finished trace plus its classification.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{early_termination_message, BuildError, JudgeError};

/// Version of the serialized [`TestCase`] layout
pub const TRACE_VERSION: u32 = 1;

/// One step of an interaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Node {
    In(String),
    Out(String),
}

impl Node {
    pub fn text(&self) -> &str {
        match self {
            Node::In(text) | Node::Out(text) => text,
        }
    }
}

/// Classification of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    BuildError,
    RuntimeError,
    Timeout,
    EarlyTermination,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::BuildError => "build-error",
            Outcome::RuntimeError => "runtime-error",
            Outcome::Timeout => "timeout",
            Outcome::EarlyTermination => "early-termination",
        };
        write!(f, "{}", s)
    }
}

/// Append-only list of interaction nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    nodes: Vec<Node>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record program output. Consecutive outputs merge into one node.
    pub fn push_output(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.nodes.last_mut() {
            Some(Node::Out(previous)) => previous.push_str(text),
            _ => self.nodes.push(Node::Out(text.to_string())),
        }
    }

    pub fn push_input(&mut self, text: &str) {
        self.nodes.push(Node::In(text.to_string()));
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}

/// Trace handle shared between an interacting task and its supervisor.
///
/// Only the interacting task appends; the supervisor takes a snapshot once
/// the task has finished or been abandoned.
#[derive(Debug, Clone, Default)]
pub struct SharedTrace(Arc<Mutex<Trace>>);

impl SharedTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_output(&self, text: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_output(text);
    }

    pub fn push_input(&self, text: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_input(text);
    }

    pub fn snapshot(&self) -> Trace {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of inputs consumed so far
    pub fn inputs_consumed(&self) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes()
            .iter()
            .filter(|node| matches!(node, Node::In(_)))
            .count()
    }
}

/// Classified interaction trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub version: u32,
    pub outcome: Outcome,
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Inputs never read by the program (early termination only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unused_inputs: Vec<String>,
    /// Time limit that was exceeded, in milliseconds (timeouts only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_ms: Option<u64>,
}

impl TestCase {
    fn with_outcome(outcome: Outcome, trace: Trace, message: Option<String>) -> Self {
        Self {
            version: TRACE_VERSION,
            outcome,
            nodes: trace.into_nodes(),
            message,
            unused_inputs: Vec::new(),
            limit_ms: None,
        }
    }

    pub fn success(trace: Trace) -> Self {
        Self::with_outcome(Outcome::Success, trace, None)
    }

    pub fn build_error(error: &BuildError) -> Self {
        Self::with_outcome(
            Outcome::BuildError,
            Trace::new(),
            Some(error.message.clone()),
        )
    }

    pub fn runtime_error(trace: Trace, message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::RuntimeError, trace, Some(message.into()))
    }

    pub fn timeout(trace: Trace, limit: Option<Duration>) -> Self {
        let message = match limit {
            Some(limit) => format!(
                "Maximum execution time exceeded: {:.3}s",
                limit.as_secs_f64()
            ),
            None => "Maximum execution time exceeded".to_string(),
        };
        let mut case = Self::with_outcome(Outcome::Timeout, trace, Some(message));
        case.limit_ms = limit.map(|limit| u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        case
    }

    pub fn early_termination(trace: Trace, unused: Vec<String>) -> Self {
        let mut case = Self::with_outcome(
            Outcome::EarlyTermination,
            trace,
            Some(early_termination_message(&unused)),
        );
        case.unused_inputs = unused;
        case
    }

    /// Classify a user-level failure, keeping the partial trace.
    ///
    /// Returns the error back when it is not the program's fault.
    pub fn from_error(error: JudgeError, trace: Trace) -> Result<Self, JudgeError> {
        match error {
            JudgeError::Build(err) => Ok(Self::build_error(&err)),
            JudgeError::Timeout(limit) => Ok(Self::timeout(trace, Some(limit))),
            JudgeError::EarlyTermination { unused } => Ok(Self::early_termination(trace, unused)),
            err @ JudgeError::MissingInput { .. } => Ok(Self::runtime_error(trace, err.to_string())),
            JudgeError::Runtime(message) => Ok(Self::runtime_error(trace, message)),
            other => Err(other),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Inputs the program consumed, in order
    pub fn inputs(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::In(text) => Some(text.as_str()),
                Node::Out(_) => None,
            })
            .collect()
    }

    /// Remove a single trailing newline from the final output node.
    pub fn strip_trailing_newline(&mut self) {
        if let Some(Node::Out(text)) = self.nodes.last_mut() {
            if text.ends_with('\n') {
                text.pop();
                if text.ends_with('\r') {
                    text.pop();
                }
            }
            if text.is_empty() {
                self.nodes.pop();
            }
        }
    }

    /// Convert a failed case into the error it represents.
    ///
    /// Used when the caller asked for failures to propagate.
    pub fn into_result(self) -> Result<Self, JudgeError> {
        let message = self.message.clone().unwrap_or_default();
        match self.outcome {
            Outcome::Success => Ok(self),
            Outcome::BuildError => Err(JudgeError::Build(BuildError::new(message))),
            Outcome::RuntimeError => Err(JudgeError::Runtime(message)),
            Outcome::Timeout => Err(JudgeError::Timeout(Duration::from_millis(
                self.limit_ms.unwrap_or_default(),
            ))),
            Outcome::EarlyTermination => Err(JudgeError::EarlyTermination {
                unused: self.unused_inputs,
            }),
        }
    }
}

impl fmt::Display for TestCase {
    /// Outputs verbatim, inputs as `<value>` followed by a newline, and a
    /// classification header plus indented diagnostic for failures.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outcome != Outcome::Success {
            writeln!(f, "@{}", self.outcome)?;
        }
        for node in &self.nodes {
            match node {
                Node::Out(text) => write!(f, "{}", text)?,
                Node::In(text) => writeln!(f, "<{}>", text)?,
            }
        }
        if let Some(message) = &self.message {
            if !self.nodes.is_empty() {
                writeln!(f)?;
            }
            for line in message.lines() {
                write!(f, "\n    {}", line)?;
            }
        }
        Ok(())
    }
}
