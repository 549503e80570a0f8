//! ejudge - build and interaction orchestration for an automated judge
//!
//! A program is built once by a [`build::BuildManager`] and run any number
//! of times by [`execution::ExecutionManager`]s. Every run produces a
//! [`trace::TestCase`]: the interleaved inputs and outputs of the program
//! plus how it ended.
//!
//! Languages are looked up in the [`registry::Registry`], which is loaded
//! from `files/languages.toml` unless another table is configured.

pub mod build;
pub mod config;
pub mod error;
pub mod execution;
pub mod interact;
pub mod isolation;
pub mod judge;
pub mod languages;
pub mod registry;
pub mod script;
pub mod trace;

pub use build::{BuildManager, BuildOptions, BuildStatus};
pub use config::{get_config, init_config, JudgeConfig};
pub use error::{BuildError, JudgeError, Result};
pub use execution::ExecutionManager;
pub use judge::{build, execute, resolve_language, run, RunOptions, RunReport};
pub use registry::{registry, Registry};
pub use trace::{Node, Outcome, TestCase};
