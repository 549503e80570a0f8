//! Build strategy for languages run as child processes
//!
//! Sources are written to a private temp directory, optionally syntax
//! checked, then compiled with the language's toolchain. Toolchains run with
//! a scrubbed environment and a wall-clock limit.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Artifact, BuildManager, BuildStrategy, ExternalArtifact, LogLevel};
use crate::config::get_config;
use crate::error::{BuildError, JudgeError, Result};
use crate::languages::{CommandVars, LanguageConfig, EXECUTABLE_NAME};

/// Capability of builds that need the external toolchain runner
pub const EXTERNAL_CAPABILITY: &str = "ejudge.external";

/// Environment variables passed through to toolchains
const TOOLCHAIN_ENV: &[&str] = &["PATH", "LANG", "LD_LIBRARY_PATH"];

const SANDBOX_DIR_MODE: u32 = 0o777;
const SANDBOX_SOURCE_MODE: u32 = 0o444;
const SANDBOX_EXECUTABLE_MODE: u32 = 0o555;

/// Builds external-process languages
#[derive(Debug, Clone)]
pub struct ExternalBuild {
    config: Arc<LanguageConfig>,
}

impl ExternalBuild {
    pub fn new(config: Arc<LanguageConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BuildStrategy for ExternalBuild {
    fn syntax_check(&self, _source: &str) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn prepare(&self, build: &BuildManager) -> Result<Artifact> {
        let sandboxed = build.is_sandboxed();
        let dir = tempfile::Builder::new().prefix("ejudge-").tempdir()?;
        if sandboxed {
            set_mode(dir.path(), SANDBOX_DIR_MODE)?;
        }

        let source_file = self.config.source_file();
        write_build_file(dir.path(), Path::new(&source_file), build.source(), sandboxed)?;

        let vars = CommandVars {
            dir: dir.path(),
            source: &source_file,
            exe: EXECUTABLE_NAME,
        };
        let timeout = get_config().compile_timeout;

        if let Some(check) = &self.config.check_command {
            let argv = LanguageConfig::expand(check, &vars);
            build.log(LogLevel::Debug, format!("checking syntax with {:?}", argv));
            run_toolchain(&argv, dir.path(), timeout).await?;
        }

        let executable = match &self.config.compile_command {
            Some(compile) => {
                let argv = LanguageConfig::expand(compile, &vars);
                build.log(LogLevel::Debug, format!("compiling with {:?}", argv));
                let compiled = run_toolchain(&argv, dir.path(), timeout).await?;
                if !compiled.output.trim().is_empty() {
                    build.log(
                        LogLevel::Debug,
                        format!("compiler output:\n{}", compiled.output.trim_end()),
                    );
                }

                let executable = dir.path().join(EXECUTABLE_NAME);
                if !executable.exists() {
                    return Err(BuildError::new(format!(
                        "compiler finished without producing {}",
                        EXECUTABLE_NAME
                    ))
                    .into());
                }
                if sandboxed {
                    set_mode(&executable, SANDBOX_EXECUTABLE_MODE)?;
                }
                Some(executable)
            }
            None => None,
        };

        Ok(Artifact::External(ExternalArtifact {
            dir,
            source_file,
            executable,
        }))
    }

    fn capabilities(&self) -> Vec<String> {
        vec![EXTERNAL_CAPABILITY.to_string()]
    }
}

/// Output of a toolchain invocation
#[derive(Debug)]
pub struct ToolchainOutput {
    /// Combined stdout and stderr
    pub output: String,
}

/// Run a compiler or checker inside the build directory.
///
/// Timeouts and non-zero exits become [`BuildError`]s carrying the
/// toolchain's combined output. A missing toolchain is a configuration error.
pub async fn run_toolchain(
    argv: &[String],
    dir: &Path,
    timeout: Duration,
) -> Result<ToolchainOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| JudgeError::Config("empty toolchain command".to_string()))?;

    debug!("Running toolchain {:?} in {:?}", argv, dir);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for var in TOOLCHAIN_ENV {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            JudgeError::Config(format!("toolchain not found: {}", program))
        } else {
            JudgeError::Io(e)
        }
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(BuildError::new(format!(
                "compilation is taking too long (more than {:.1}s)",
                timeout.as_secs_f64()
            ))
            .into())
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(ToolchainOutput { output: combined })
    } else {
        let message = if combined.trim().is_empty() {
            format!("{} failed with {}", program, output.status)
        } else {
            combined
        };
        Err(BuildError::new(message).into())
    }
}

/// Write a file inside the build directory.
///
/// Paths are resolved lexically; anything landing outside `build_dir` is a
/// [`JudgeError::Permission`]. Existing files are never overwritten.
pub fn write_build_file(
    build_dir: &Path,
    path: &Path,
    data: &str,
    sandboxed: bool,
) -> Result<PathBuf> {
    let target = normalize(&build_dir.join(path));
    if !target.starts_with(build_dir) || target == build_dir {
        return Err(JudgeError::Permission(format!(
            "cannot write {:?} outside build directory {:?}",
            path, build_dir
        )));
    }
    if target.exists() {
        return Err(JudgeError::IllegalState(format!(
            "file {:?} already exists",
            target
        )));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, data)?;
    if sandboxed {
        set_mode(&target, SANDBOX_SOURCE_MODE)?;
    }
    Ok(target)
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildOptions;
    use crate::languages::{builtin_languages, Strategy};
    use tempfile::TempDir;

    fn has_tool(tool: &str) -> bool {
        std::process::Command::new(tool)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    fn language(name: &str) -> Arc<LanguageConfig> {
        Arc::new(
            builtin_languages()
                .unwrap()
                .into_iter()
                .find(|l| l.name == name)
                .unwrap(),
        )
    }

    fn shell_language(compile: Option<&str>) -> Arc<LanguageConfig> {
        Arc::new(LanguageConfig {
            name: "sh".to_string(),
            description: "POSIX shell".to_string(),
            strategy: Strategy::External,
            source_ext: "sh".to_string(),
            check_command: None,
            compile_command: compile.map(|c| c.split_whitespace().map(String::from).collect()),
            run_command: vec!["sh".to_string(), "{dir}/{source}".to_string()],
            stream_compare: false,
            extensions: vec!["sh".to_string()],
            aliases: Vec::new(),
        })
    }

    #[test]
    fn test_write_inside_build_dir() {
        let dir = TempDir::new().unwrap();
        let path = write_build_file(dir.path(), Path::new("sub/../main.c"), "int x;", false).unwrap();
        assert_eq!(path, dir.path().join("main.c"));
        assert_eq!(fs::read_to_string(path).unwrap(), "int x;");
    }

    #[test]
    fn test_write_outside_build_dir_is_rejected() {
        let dir = TempDir::new().unwrap();
        for escape in ["../evil.c", "/etc/passwd", "main./../../x"] {
            let result = write_build_file(dir.path(), Path::new(escape), "", false);
            assert!(
                matches!(result, Err(JudgeError::Permission(_))),
                "{} was not rejected",
                escape
            );
        }
    }

    #[test]
    fn test_write_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        write_build_file(dir.path(), Path::new("main.c"), "a", false).unwrap();
        let again = write_build_file(dir.path(), Path::new("main.c"), "b", false);
        assert!(matches!(again, Err(JudgeError::IllegalState(_))));
    }

    #[test]
    fn test_sandboxed_write_is_read_only() {
        let dir = TempDir::new().unwrap();
        let path = write_build_file(dir.path(), Path::new("main.c"), "a", true).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SANDBOX_SOURCE_MODE);
    }

    #[tokio::test]
    async fn test_toolchain_failure_is_build_error() {
        let dir = TempDir::new().unwrap();
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo oops >&2; exit 3".to_string()];
        let err = run_toolchain(&argv, dir.path(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            JudgeError::Build(err) => assert_eq!(err.message.trim(), "oops"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_toolchain_timeout_is_build_error() {
        let dir = TempDir::new().unwrap();
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let err = run_toolchain(&argv, dir.path(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Build(ref e) if e.message.contains("too long")));
    }

    #[tokio::test]
    async fn test_missing_toolchain_is_config_error() {
        let dir = TempDir::new().unwrap();
        let argv = vec!["ejudge-no-such-compiler".to_string()];
        let err = run_toolchain(&argv, dir.path(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Config(_)));
    }

    #[tokio::test]
    async fn test_interpreted_build_writes_source() {
        let build = BuildManager::new(
            "sh",
            "echo hi",
            BuildOptions::default(),
            Box::new(ExternalBuild::new(shell_language(None))),
        );
        let artifact = build.build().await.unwrap();
        let external = artifact.as_external().unwrap();
        assert_eq!(external.source_file, "main.sh");
        assert_eq!(fs::read_to_string(external.source_path()).unwrap(), "echo hi");
        assert!(external.executable.is_none());

        let dir = external.dir().to_path_buf();
        drop(artifact);
        build.close().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_compile_without_executable_fails() {
        let build = BuildManager::new(
            "sh",
            "echo hi",
            BuildOptions::default(),
            Box::new(ExternalBuild::new(shell_language(Some("true")))),
        );
        let err = build.build().await.unwrap_err();
        assert!(matches!(err, JudgeError::Build(ref e) if e.message.contains("main.exe")));
    }

    #[tokio::test]
    async fn test_c_compile_error_is_reported() {
        if !has_tool("gcc") {
            eprintln!("gcc not installed, skipping");
            return;
        }
        let build = BuildManager::new(
            "c",
            "int main( { return 0; }",
            BuildOptions::default(),
            Box::new(ExternalBuild::new(language("c"))),
        );
        let err = build.build().await.unwrap_err();
        match err {
            JudgeError::Build(err) => assert!(err.message.contains("error"), "{}", err.message),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sandboxed_c_build_hardens_permissions() {
        if !has_tool("gcc") {
            eprintln!("gcc not installed, skipping");
            return;
        }
        let build = BuildManager::new(
            "c",
            "int main(void) { return 0; }",
            BuildOptions::default().sandboxed(true),
            Box::new(ExternalBuild::new(language("c"))),
        );
        let artifact = build.build().await.unwrap();
        let external = artifact.as_external().unwrap();
        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(external.dir()), SANDBOX_DIR_MODE);
        assert_eq!(mode(&external.source_path()), SANDBOX_SOURCE_MODE);
        assert_eq!(
            mode(external.executable.as_deref().unwrap()),
            SANDBOX_EXECUTABLE_MODE
        );
    }
}
