//! Configuration loading for trapsort.
//!
//! Settings are read from a TOML file. Every section is optional; anything
//! missing falls back to its default.
//!
//! # Configuration File Format
//!
//! ```toml
//! [species]
//! folders = ["deer", "roe_deer", "wild_boar", "empty"]
//! empty = "empty"
//!
//! [scan]
//! recursive = false
//! include_hidden = false
//! exclude_patterns = ["**/thumbnails/**"]
//! exclude_regex = ["^IMG_\\d+_preview"]
//!
//! [engine]
//! default_strategy = "round-robin"
//! classify_timeout_secs = 30
//!
//! [models.resnet50]
//! target_labels = ["animal"]
//! min_confidence = 0.25
//! weights = "weights/resnet50.onnx"
//! detector = { program = "detect", args = ["{image}"] }
//! classifier = { program = "classify", args = ["--weights", "{weights}", "{image}", "{regions}"] }
//! trainer = { program = "train", args = ["{manifest}", "{epochs}", "{output}"] }
//!
//! [training]
//! weights_dir = "weights"
//! ```

use crate::species::{DEFAULT_EMPTY_FOLDER, DEFAULT_SPECIES, SpeciesError, SpeciesRegistry};
use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the per-directory configuration file.
pub const LOCAL_CONFIG_FILE: &str = ".trapsortrc.toml";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("Invalid glob pattern '{0}'")]
    InvalidGlobPattern(String),
    #[error("Invalid regex pattern '{pattern}': {reason}")]
    InvalidRegexPattern { pattern: String, reason: String },
    #[error("Invalid species configuration: {0}")]
    Species(#[from] SpeciesError),
    #[error("IO error reading configuration: {0}")]
    IoError(String),
}

/// Model families a cascade strategy can be built from and retrained for.
///
/// Each family registers a strategy under its own name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    #[serde(rename = "resnet50")]
    ResNet50,
    #[serde(rename = "efficientnet-b0")]
    EfficientNetB0,
    #[serde(rename = "mobilenet-v3")]
    MobileNetV3,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 3] = [
        ModelFamily::ResNet50,
        ModelFamily::EfficientNetB0,
        ModelFamily::MobileNetV3,
    ];

    /// Name of the strategy this family is registered under.
    pub fn strategy_name(&self) -> &'static str {
        match self {
            ModelFamily::ResNet50 => "resnet50",
            ModelFamily::EfficientNetB0 => "efficientnet-b0",
            ModelFamily::MobileNetV3 => "mobilenet-v3",
        }
    }

    /// Parses a family from its strategy name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|family| family.strategy_name() == name)
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy_name())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrapsortConfig {
    pub species: SpeciesConfig,
    pub scan: ScanConfig,
    pub engine: EngineConfig,
    pub models: BTreeMap<ModelFamily, ModelConfig>,
    pub training: TrainingConfig,
}

/// Destination taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesConfig {
    /// Folder names in class-index order.
    pub folders: Vec<String>,
    /// Folder that receives empty frames and classification fallbacks.
    pub empty: String,
}

impl Default for SpeciesConfig {
    fn default() -> Self {
        Self {
            folders: DEFAULT_SPECIES.iter().map(|s| s.to_string()).collect(),
            empty: DEFAULT_EMPTY_FOLDER.to_string(),
        }
    }
}

/// Source folder scanning rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Descend into subdirectories when building the queue.
    pub recursive: bool,
    /// Queue files whose name starts with ".". Off by default.
    pub include_hidden: bool,
    /// Glob patterns, matched against the path relative to the root.
    pub exclude_patterns: Vec<String>,
    /// Regex patterns, matched against the file name.
    pub exclude_regex: Vec<String>,
}

/// Distribution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_strategy: String,
    /// Upper bound on a single classification call.
    pub classify_timeout_secs: u64,
    /// Seed for the random strategy; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_strategy: "round-robin".to_string(),
            classify_timeout_secs: 30,
            seed: None,
        }
    }
}

impl EngineConfig {
    pub fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.classify_timeout_secs.max(1))
    }
}

/// An external program invocation with placeholder arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Expands `{name}` placeholders in every argument.
    pub fn render_args(&self, values: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                values.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{}}}", key), value)
                })
            })
            .collect()
    }
}

/// Detector + classifier cascade for one model family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub detector: CommandSpec,
    pub classifier: CommandSpec,
    /// Detection labels that count as an animal.
    #[serde(default = "default_target_labels")]
    pub target_labels: Vec<String>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Classifier weights in force at startup.
    #[serde(default)]
    pub weights: Option<PathBuf>,
    #[serde(default)]
    pub trainer: Option<CommandSpec>,
}

fn default_target_labels() -> Vec<String> {
    vec!["animal".to_string()]
}

fn default_min_confidence() -> f32 {
    0.2
}

/// Training output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Directory new weight artifacts are written to.
    pub weights_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            weights_dir: PathBuf::from("weights"),
        }
    }
}

impl TrapsortConfig {
    /// Load configuration from a file, with fallback to defaults.
    ///
    /// Attempts to load configuration in the following order:
    /// 1. If `config_path` is provided, load from that file
    /// 2. Look for `.trapsortrc.toml` in the current directory
    /// 3. Look for `~/.config/trapsort/config.toml` in home directory
    /// 4. Fall back to default configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is explicitly provided but cannot be read,
    /// or if any discovered file fails to parse.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        let local_config = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home)
                .join(".config")
                .join("trapsort")
                .join("config.toml");
            if home_config.exists() {
                return Self::load_from_file(&home_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ConfigInvalid(e.to_string()))
    }

    /// Builds the species registry described by the `[species]` section.
    pub fn species_registry(&self) -> Result<SpeciesRegistry, ConfigError> {
        Ok(SpeciesRegistry::new(
            &self.species.folders,
            &self.species.empty,
        )?)
    }
}

impl ScanConfig {
    /// Compile the scan rules into matchers.
    ///
    /// # Errors
    ///
    /// Returns an error if any regex or glob patterns are invalid.
    pub fn compile(&self) -> Result<ScanFilters, ConfigError> {
        let exclude_patterns = self
            .exclude_patterns
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|_| ConfigError::InvalidGlobPattern(pattern.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let exclude_regexes = self
            .exclude_regex
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::InvalidRegexPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ScanFilters {
            include_hidden: self.include_hidden,
            exclude_patterns,
            exclude_regexes,
        })
    }
}

/// Compiled scan filters.
#[derive(Debug, Clone, Default)]
pub struct ScanFilters {
    include_hidden: bool,
    exclude_patterns: Vec<Pattern>,
    exclude_regexes: Vec<Regex>,
}

impl ScanFilters {
    /// Check if a file should be queued.
    ///
    /// `relative_path` is the file's path relative to the scanned root.
    /// Hidden files and files under hidden folders are dropped first, then
    /// glob and regex excludes apply.
    pub fn should_include(&self, relative_path: &Path) -> bool {
        let file_name = relative_path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        if !self.include_hidden && relative_path.components().any(is_hidden) {
            return false;
        }

        if self
            .exclude_patterns
            .iter()
            .any(|pattern| pattern.matches_path(relative_path))
        {
            return false;
        }

        !self
            .exclude_regexes
            .iter()
            .any(|regex| regex.is_match(&file_name))
    }
}

fn is_hidden(component: Component<'_>) -> bool {
    matches!(component, Component::Normal(name) if name.to_string_lossy().starts_with('.'))
}
