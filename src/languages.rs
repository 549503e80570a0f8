//! Language configuration for building and running programs

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// How a language's programs are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Interpreted by the embedded engine inside the judge process
    InProcess,
    /// Compiled and/or run as a child process
    External,
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Canonical language id (e.g., "c++")
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub strategy: Strategy,
    /// Extension of the source file written to the build directory, without dot
    pub source_ext: String,
    /// Syntax check command template (None if not needed)
    pub check_command: Option<Vec<String>>,
    /// Compile command template (None if not needed)
    pub compile_command: Option<Vec<String>>,
    /// Run command template (empty for in-process languages)
    pub run_command: Vec<String>,
    /// Compare whole stdin/stdout streams instead of step-by-step interaction
    pub stream_compare: bool,
    /// File extensions resolving to this language, without dot
    pub extensions: Vec<String>,
    pub aliases: Vec<String>,
}

/// Values substituted into command templates
#[derive(Debug, Clone)]
pub struct CommandVars<'a> {
    /// Absolute build directory
    pub dir: &'a Path,
    /// Source file name inside the build directory
    pub source: &'a str,
    /// Executable file name inside the build directory
    pub exe: &'a str,
}

impl LanguageConfig {
    /// Name of the source file inside the build directory (e.g., "main.cpp")
    pub fn source_file(&self) -> String {
        if self.source_ext.is_empty() {
            "main".to_string()
        } else {
            format!("main.{}", self.source_ext)
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Expand `{dir}`, `{source}` and `{exe}` in a command template
    pub fn expand(template: &[String], vars: &CommandVars<'_>) -> Vec<String> {
        let dir = vars.dir.display().to_string();
        template
            .iter()
            .map(|part| {
                part.replace("{dir}", &dir)
                    .replace("{source}", vars.source)
                    .replace("{exe}", vars.exe)
            })
            .collect()
    }
}

/// Name of the compiled executable inside the build directory
pub const EXECUTABLE_NAME: &str = "main.exe";

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    #[serde(default)]
    description: String,
    strategy: Strategy,
    source_ext: String,
    check_command: Option<String>,
    compile_command: Option<String>,
    run_command: Option<String>,
    #[serde(default)]
    stream_compare: bool,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Parse a language table. Languages come back sorted by name.
pub fn parse_languages(content: &str) -> anyhow::Result<Vec<LanguageConfig>> {
    let raw_configs: BTreeMap<String, RawLanguageConfig> =
        toml::from_str(content).context("Failed to parse language table")?;

    let mut languages = Vec::with_capacity(raw_configs.len());

    for (name, raw) in raw_configs {
        let run_command = raw.run_command.as_deref().map(into_command).unwrap_or_default();

        match raw.strategy {
            Strategy::External if run_command.is_empty() => {
                anyhow::bail!("External language {} has no run_command", name);
            }
            Strategy::InProcess
                if !run_command.is_empty()
                    || raw.compile_command.is_some()
                    || raw.check_command.is_some() =>
            {
                anyhow::bail!("In-process language {} cannot define commands", name);
            }
            _ => {}
        }

        languages.push(LanguageConfig {
            description: if raw.description.is_empty() {
                name.clone()
            } else {
                raw.description
            },
            name: name.to_lowercase(),
            strategy: raw.strategy,
            source_ext: raw.source_ext.trim_start_matches('.').to_string(),
            check_command: raw.check_command.as_deref().map(into_command),
            compile_command: raw.compile_command.as_deref().map(into_command),
            run_command,
            stream_compare: raw.stream_compare,
            extensions: raw
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_string())
                .collect(),
            aliases: raw.aliases.iter().map(|alias| alias.to_lowercase()).collect(),
        });
    }

    languages.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(languages)
}

/// Language table compiled into the binary
pub fn builtin_languages() -> anyhow::Result<Vec<LanguageConfig>> {
    let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
    parse_languages(content)
}

/// Load the language table from `path`, or the built-in one when absent
pub fn load_languages(path: Option<&Path>) -> anyhow::Result<Vec<LanguageConfig>> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read language table {:?}", path))?;
            parse_languages(&content)
        }
        None => builtin_languages(),
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
