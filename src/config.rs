//! Judge configuration
//!
//! Configuration for builds, interaction and the isolation worker, loaded
//! from the environment or set programmatically before the first run.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

/// Judge configuration
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Wall-clock limit for compilers and syntax checks (default: 10s)
    pub compile_timeout: Duration,
    /// Quiet period after which a running program is considered paused
    /// and waiting for input (default: 50ms)
    pub settle_time: Duration,
    /// Maximum bytes of stdout accepted from an external program (default: 1 MiB)
    pub max_output_bytes: usize,
    /// Program spawned as the isolation worker (default: the current executable)
    pub worker_program: Option<PathBuf>,
    /// Identity the worker assumes for sandboxed runs when started as root
    pub sandbox_user: String,
    /// Alternative language table; the embedded one is used when unset
    pub languages_file: Option<PathBuf>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(10),
            settle_time: Duration::from_millis(50),
            max_output_bytes: 1 << 20,
            worker_program: None,
            sandbox_user: "nobody".to_string(),
            languages_file: None,
        }
    }
}

const COMPILE_TIMEOUT_VAR: &str = "EJUDGE_COMPILE_TIMEOUT_MS";
const SETTLE_TIME_VAR: &str = "EJUDGE_SETTLE_MS";
const MAX_OUTPUT_VAR: &str = "EJUDGE_MAX_OUTPUT_BYTES";
const WORKER_VAR: &str = "EJUDGE_WORKER";
const SANDBOX_USER_VAR: &str = "EJUDGE_SANDBOX_USER";
const LANGUAGES_VAR: &str = "LANGUAGES_CONFIG";

impl JudgeConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = read_number(COMPILE_TIMEOUT_VAR)? {
            config.compile_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_number(SETTLE_TIME_VAR)? {
            config.settle_time = Duration::from_millis(ms);
        }
        if let Some(bytes) = read_number(MAX_OUTPUT_VAR)? {
            config.max_output_bytes = bytes as usize;
        }
        if let Ok(path) = env::var(WORKER_VAR) {
            config.worker_program = Some(PathBuf::from(path));
        }
        if let Ok(user) = env::var(SANDBOX_USER_VAR) {
            config.sandbox_user = user;
        }
        if let Ok(path) = env::var(LANGUAGES_VAR) {
            config.languages_file = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    /// Environment a worker process needs to reproduce this configuration.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (
                COMPILE_TIMEOUT_VAR.to_string(),
                self.compile_timeout.as_millis().to_string(),
            ),
            (
                SETTLE_TIME_VAR.to_string(),
                self.settle_time.as_millis().to_string(),
            ),
            (
                MAX_OUTPUT_VAR.to_string(),
                self.max_output_bytes.to_string(),
            ),
            (SANDBOX_USER_VAR.to_string(), self.sandbox_user.clone()),
        ];
        if let Some(path) = &self.languages_file {
            vars.push((LANGUAGES_VAR.to_string(), path.display().to_string()));
        }
        vars
    }

    /// Program to spawn for isolated work.
    pub fn worker_program(&self) -> std::io::Result<PathBuf> {
        match &self.worker_program {
            Some(path) => Ok(path.clone()),
            None => env::current_exe(),
        }
    }
}

fn read_number(var: &str) -> anyhow::Result<Option<u64>> {
    match env::var(var) {
        Ok(value) => {
            let number = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("Invalid value for {}: {}", var, value))?;
            Ok(Some(number))
        }
        Err(_) => Ok(None),
    }
}

/// Global judge configuration
static JUDGE_CONFIG: OnceLock<JudgeConfig> = OnceLock::new();

/// Install the process-wide configuration. Fails if already initialized.
pub fn init_config(config: JudgeConfig) -> anyhow::Result<()> {
    JUDGE_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Judge configuration already initialized"))?;

    Ok(())
}

/// Get judge configuration
pub fn get_config() -> &'static JudgeConfig {
    JUDGE_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<JudgeConfig> = OnceLock::new();

        DEFAULT.get_or_init(|| {
            warn!("Judge configuration not initialized, using environment and defaults");
            JudgeConfig::from_env().unwrap_or_else(|e| {
                warn!("Ignoring invalid judge configuration: {:#}", e);
                JudgeConfig::default()
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JudgeConfig::default();
        assert_eq!(config.compile_timeout, Duration::from_secs(10));
        assert_eq!(config.settle_time, Duration::from_millis(50));
        assert_eq!(config.sandbox_user, "nobody");
        assert!(config.worker_program.is_none());
    }

    #[test]
    fn test_to_env_carries_timeouts() {
        let config = JudgeConfig {
            compile_timeout: Duration::from_millis(1500),
            languages_file: Some(PathBuf::from("/etc/ejudge/languages.toml")),
            ..JudgeConfig::default()
        };
        let vars = config.to_env();
        assert!(vars.contains(&(COMPILE_TIMEOUT_VAR.to_string(), "1500".to_string())));
        assert!(vars.contains(&(
            LANGUAGES_VAR.to_string(),
            "/etc/ejudge/languages.toml".to_string()
        )));
    }

    #[test]
    fn test_explicit_worker_program() {
        let config = JudgeConfig {
            worker_program: Some(PathBuf::from("/usr/bin/ejudge")),
            ..JudgeConfig::default()
        };
        assert_eq!(
            config.worker_program().unwrap(),
            PathBuf::from("/usr/bin/ejudge")
        );
    }
}
