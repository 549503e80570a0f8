//! Build strategy for languages interpreted by the embedded engine

use async_trait::async_trait;

use super::{Artifact, BuildManager, BuildStrategy};
use crate::error::{BuildError, Result};
use crate::script::{self, CompiledScript};

/// Capability of builds interpreted inside the judge
pub const IN_PROCESS_CAPABILITY: &str = "ejudge.in-process";

/// Parses the program and seeds its namespace. Leaves nothing on disk.
#[derive(Debug, Clone, Default)]
pub struct InProcessBuild;

impl InProcessBuild {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BuildStrategy for InProcessBuild {
    fn syntax_check(&self, source: &str) -> std::result::Result<(), String> {
        script::compile(source).map(|_| ())
    }

    async fn prepare(&self, build: &BuildManager) -> Result<Artifact> {
        let ast = script::compile(build.source()).map_err(BuildError::new)?;
        Ok(Artifact::InProcess(CompiledScript {
            ast,
            globals: build.options().globals.clone(),
            locals: build.options().locals.clone(),
        }))
    }

    fn capabilities(&self) -> Vec<String> {
        vec![IN_PROCESS_CAPABILITY.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildOptions, BuildStatus};
    use crate::error::JudgeError;

    #[tokio::test]
    async fn test_valid_program_builds() {
        let options = BuildOptions::default().with_global("limit", "3");
        let build = BuildManager::new("rhai", "print(limit);", options, Box::new(InProcessBuild::new()));
        let artifact = build.build().await.unwrap();
        let script = artifact.as_script().unwrap();
        assert_eq!(script.globals.get("limit").map(String::as_str), Some("3"));
        assert!(artifact.as_external().is_err());
    }

    #[tokio::test]
    async fn test_invalid_syntax_is_build_error() {
        let build = BuildManager::new(
            "rhai",
            "let x = ;",
            BuildOptions::default(),
            Box::new(InProcessBuild::new()),
        );
        match build.build().await {
            Err(JudgeError::Build(err)) => {
                assert!(err.message.contains("SyntaxError"), "{}", err.message)
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(build.status().await, BuildStatus::Failed);
        assert!(build
            .required_capabilities()
            .contains(&IN_PROCESS_CAPABILITY.to_string()));
    }
}
