//! Language registry
//!
//! Maps language ids, aliases and file extensions to the strategies that
//! build and run them. Populated at startup, read-only afterwards.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::build::external::ExternalBuild;
use crate::build::in_process::InProcessBuild;
use crate::build::{BuildManager, BuildOptions, BuildStrategy, BASE_CAPABILITY};
use crate::config::get_config;
use crate::error::{JudgeError, Result};
use crate::execution::external::ExternalExecution;
use crate::execution::in_process::InProcessExecution;
use crate::execution::{ExecutionManager, ExecutionStrategy};
use crate::languages::{load_languages, LanguageConfig, Strategy};

pub type BuildFactory = Arc<dyn Fn() -> Box<dyn BuildStrategy> + Send + Sync>;
pub type ExecutionFactory = Arc<dyn Fn() -> Box<dyn ExecutionStrategy> + Send + Sync>;

/// Strategies and names bound to one language
#[derive(Clone)]
pub struct LanguageBinding {
    pub language: String,
    pub description: String,
    pub extensions: Vec<String>,
    pub aliases: Vec<String>,
    build: BuildFactory,
    execution: ExecutionFactory,
}

impl fmt::Debug for LanguageBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageBinding")
            .field("language", &self.language)
            .field("extensions", &self.extensions)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

impl LanguageBinding {
    pub fn new<B, E>(language: impl Into<String>, build: B, execution: E) -> Self
    where
        B: Fn() -> Box<dyn BuildStrategy> + Send + Sync + 'static,
        E: Fn() -> Box<dyn ExecutionStrategy> + Send + Sync + 'static,
    {
        let language = language.into();
        Self {
            description: language.clone(),
            language,
            extensions: Vec::new(),
            aliases: Vec::new(),
            build: Arc::new(build),
            execution: Arc::new(execution),
        }
    }

    pub fn with_extensions(mut self, extensions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extensions = extensions.into_iter().map(|e| e.into()).collect();
        self
    }

    pub fn with_aliases(mut self, aliases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.aliases = aliases.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Binding for a language defined in the language table
    pub fn from_config(config: LanguageConfig) -> Self {
        let config = Arc::new(config);
        let binding = match config.strategy {
            Strategy::InProcess => LanguageBinding::new(
                config.name.clone(),
                || Box::new(InProcessBuild::new()) as Box<dyn BuildStrategy>,
                || Box::new(InProcessExecution::new()) as Box<dyn ExecutionStrategy>,
            ),
            Strategy::External => {
                let build_config = config.clone();
                let run_config = config.clone();
                LanguageBinding::new(
                    config.name.clone(),
                    move || Box::new(ExternalBuild::new(build_config.clone())) as Box<dyn BuildStrategy>,
                    move || {
                        Box::new(ExternalExecution::new(run_config.clone())) as Box<dyn ExecutionStrategy>
                    },
                )
            }
        };
        binding
            .with_description(config.description.clone())
            .with_extensions(config.extensions.clone())
            .with_aliases(config.aliases.clone())
    }

    pub fn build_strategy(&self) -> Box<dyn BuildStrategy> {
        (self.build)()
    }

    pub fn execution_strategy(&self) -> Box<dyn ExecutionStrategy> {
        (self.execution)()
    }
}

/// Language table
#[derive(Debug, Default)]
pub struct Registry {
    bindings: HashMap<String, LanguageBinding>,
    /// Alias (and id) to canonical id
    names: HashMap<String, String>,
    /// Extension to canonical id
    extensions: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every language of a language table
    pub fn from_languages(languages: Vec<LanguageConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for config in languages {
            registry.register(LanguageBinding::from_config(config), true)?;
        }
        Ok(registry)
    }

    /// Bind a language. Later registrations win unless `force` is set, in
    /// which case a name or extension already bound to another language is
    /// a configuration error.
    pub fn register(&mut self, binding: LanguageBinding, force: bool) -> Result<()> {
        let language = binding.language.to_lowercase();

        let names: Vec<String> = std::iter::once(language.clone())
            .chain(binding.aliases.iter().map(|a| a.to_lowercase()))
            .collect();
        let extensions: Vec<String> = binding
            .extensions
            .iter()
            .map(|e| normalize_extension(e))
            .collect();

        if force {
            for name in &names {
                if let Some(existing) = self.names.get(name) {
                    if existing != &language {
                        return Err(JudgeError::Config(format!(
                            "name {:?} is already bound to {}",
                            name, existing
                        )));
                    }
                }
            }
            for ext in &extensions {
                if let Some(existing) = self.extensions.get(ext) {
                    if existing != &language {
                        return Err(JudgeError::Config(format!(
                            "extension .{} is already bound to {}",
                            ext, existing
                        )));
                    }
                }
            }
        }

        for name in names {
            if let Some(previous) = self.names.insert(name.clone(), language.clone()) {
                if previous != language {
                    warn!("Language name {:?} rebound from {} to {}", name, previous, language);
                }
            }
        }
        for ext in extensions {
            self.extensions.insert(ext, language.clone());
        }
        debug!("Registered language {}", language);
        self.bindings.insert(language, binding);
        Ok(())
    }

    /// Canonical id of a language id or alias
    pub fn canonical(&self, name: &str) -> Result<&str> {
        self.names
            .get(&name.to_lowercase())
            .map(String::as_str)
            .ok_or_else(|| JudgeError::UnknownLanguage(name.to_string()))
    }

    pub fn binding(&self, name: &str) -> Result<&LanguageBinding> {
        let language = self.canonical(name)?;
        self.bindings
            .get(language)
            .ok_or_else(|| JudgeError::UnknownLanguage(name.to_string()))
    }

    /// Language of a file name (`main.c`) or extension (`.c`, `c`)
    pub fn resolve_language(&self, filename_or_extension: &str) -> Result<String> {
        let ext = match filename_or_extension.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => filename_or_extension,
        };
        self.extensions
            .get(&normalize_extension(ext))
            .cloned()
            .ok_or_else(|| JudgeError::UnknownLanguage(filename_or_extension.to_string()))
    }

    pub fn new_build_manager(
        &self,
        language: &str,
        source: impl Into<String>,
        options: BuildOptions,
    ) -> Result<Arc<BuildManager>> {
        let binding = self.binding(language)?;
        Ok(BuildManager::new(
            binding.language.clone(),
            source,
            options,
            binding.build_strategy(),
        ))
    }

    pub fn new_execution_manager(
        &self,
        language: &str,
        build: &Arc<BuildManager>,
        inputs: Vec<String>,
    ) -> Result<ExecutionManager> {
        let binding = self.binding(language)?;
        if binding.language != build.language() {
            return Err(JudgeError::IllegalState(format!(
                "build manager for {} cannot run as {}",
                build.language(),
                binding.language
            )));
        }
        Ok(ExecutionManager::new(
            build.clone(),
            inputs,
            binding.execution_strategy(),
        ))
    }

    /// Canonical language ids, sorted
    pub fn languages(&self) -> Vec<&LanguageBinding> {
        let mut bindings: Vec<&LanguageBinding> = self.bindings.values().collect();
        bindings.sort_by(|a, b| a.language.cmp(&b.language));
        bindings
    }

    /// Capability names this registry can provide to an isolated run
    pub fn capabilities(&self) -> BTreeSet<String> {
        let mut capabilities = BTreeSet::from([BASE_CAPABILITY.to_string()]);
        for binding in self.bindings.values() {
            capabilities.extend(binding.build_strategy().capabilities());
        }
        capabilities
    }

    /// Fail unless every requested capability is available
    pub fn ensure_capabilities(&self, required: &[String]) -> Result<()> {
        let available = self.capabilities();
        let missing: Vec<&str> = required
            .iter()
            .filter(|c| !available.contains(*c))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(JudgeError::Config(format!(
                "isolated context is missing capabilities: {}",
                missing.join(", ")
            )))
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_string()
}

/// Global language registry
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Install the process-wide registry. Fails if already initialized.
pub fn init_registry(registry: Registry) -> anyhow::Result<()> {
    REGISTRY
        .set(registry)
        .map_err(|_| anyhow::anyhow!("Language registry already initialized"))?;
    Ok(())
}

/// The process-wide registry, loaded from the configured language table on
/// first use
pub fn registry() -> Result<&'static Registry> {
    if let Some(registry) = REGISTRY.get() {
        return Ok(registry);
    }
    let languages = load_languages(get_config().languages_file.as_deref())
        .map_err(|e| JudgeError::Config(format!("{:#}", e)))?;
    let registry = Registry::from_languages(languages)?;
    Ok(REGISTRY.get_or_init(|| registry))
}

/// Builtin languages, with scripts interpreted in the calling process
/// instead of a worker
#[cfg(test)]
pub(crate) fn direct_registry() -> Registry {
    let mut registry =
        Registry::from_languages(crate::languages::builtin_languages().unwrap()).unwrap();
    let rhai = LanguageBinding::new(
        "rhai",
        || Box::new(InProcessBuild::new()) as Box<dyn BuildStrategy>,
        || Box::new(InProcessExecution::direct()) as Box<dyn ExecutionStrategy>,
    )
    .with_extensions(["rhai"])
    .with_aliases(["script"]);
    registry.register(rhai, true).unwrap();
    registry
}
