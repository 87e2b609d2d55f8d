use crate::error::{RecipeError, Result};
use crate::paths;
use crate::types::QaType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// CollaboratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_generation_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_generation_temperature() -> f32 {
    0.6
}

fn default_timeout_seconds() -> u64 {
    120
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_generation_temperature(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReviewerConfig / RepairConfig
// ---------------------------------------------------------------------------

/// The quality reviewer shares the collaborator endpoint but uses its own
/// model and temperature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerConfig {
    #[serde(default = "default_reviewer_model")]
    pub model: String,
    #[serde(default = "default_low_temperature")]
    pub temperature: f32,
}

fn default_reviewer_model() -> String {
    "gpt-4o".to_string()
}

fn default_low_temperature() -> f32 {
    0.2
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            model: default_reviewer_model(),
            temperature: default_low_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_low_temperature")]
    pub temperature: f32,
}

fn default_max_attempts() -> u32 {
    crate::repair::DEFAULT_MAX_ATTEMPTS
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            temperature: default_low_temperature(),
        }
    }
}

// ---------------------------------------------------------------------------
// GenerationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub qa_type: String,
    pub count: usize,
}

/// How the work units of one input record are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationMode {
    /// Every listed type, in order, with its count.
    Fixed { counts: Vec<TypeCount> },
    /// A random subset of the problem-solving types with random counts.
    Sampled {
        #[serde(default = "default_types_per_record")]
        types_per_record: usize,
        #[serde(default = "default_per_type")]
        per_type_min: usize,
        #[serde(default = "default_per_type")]
        per_type_max: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },
}

fn default_types_per_record() -> usize {
    3
}

fn default_per_type() -> usize {
    1
}

impl Default for GenerationMode {
    fn default() -> Self {
        GenerationMode::Sampled {
            types_per_record: default_types_per_record(),
            per_type_min: default_per_type(),
            per_type_max: default_per_type(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub mode: GenerationMode,
    /// Truncate both output streams before a run instead of resuming.
    #[serde(default)]
    pub clear_output_on_start: bool,
}

// ---------------------------------------------------------------------------
// StreamsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default = "default_input")]
    pub input: PathBuf,
    #[serde(default = "default_success")]
    pub success: PathBuf,
    #[serde(default = "default_failure")]
    pub failure: PathBuf,
}

fn default_input() -> PathBuf {
    PathBuf::from(paths::DEFAULT_INPUT)
}

fn default_success() -> PathBuf {
    PathBuf::from(paths::DEFAULT_SUCCESS)
}

fn default_failure() -> PathBuf {
    PathBuf::from(paths::DEFAULT_FAILURE)
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            success: default_success(),
            failure: default_failure(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
    /// Absent disables the quality gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<ReviewerConfig>,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            collaborator: CollaboratorConfig::default(),
            reviewer: Some(ReviewerConfig::default()),
            repair: RepairConfig::default(),
            generation: GenerationConfig::default(),
            streams: StreamsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(RecipeError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn input_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.streams.input)
    }

    pub fn success_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.streams.success)
    }

    pub fn failure_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.streams.failure)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut warn = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message });
        };

        if self.collaborator.base_url.trim().is_empty() {
            warn(WarnLevel::Error, "collaborator.base_url is empty".to_string());
        }
        if self.collaborator.model.trim().is_empty() {
            warn(WarnLevel::Error, "collaborator.model is empty".to_string());
        }

        match &self.generation.mode {
            GenerationMode::Fixed { counts } => {
                for entry in counts {
                    if entry.qa_type.parse::<QaType>().is_err() {
                        warn(
                            WarnLevel::Error,
                            format!("unknown qa type '{}' in generation.mode.counts", entry.qa_type),
                        );
                    } else if entry.count == 0 {
                        warn(
                            WarnLevel::Warning,
                            format!("qa type '{}' has count 0 and will be skipped", entry.qa_type),
                        );
                    }
                }
                if counts.iter().all(|c| c.count == 0) {
                    warn(
                        WarnLevel::Warning,
                        "generation.mode.counts requests no records".to_string(),
                    );
                }
            }
            GenerationMode::Sampled {
                types_per_record,
                per_type_min,
                per_type_max,
                ..
            } => {
                if per_type_min > per_type_max {
                    warn(
                        WarnLevel::Error,
                        format!(
                            "per_type_min ({per_type_min}) is greater than per_type_max ({per_type_max})"
                        ),
                    );
                }
                let available = QaType::problem_solving().len();
                if *types_per_record > available {
                    warn(
                        WarnLevel::Warning,
                        format!(
                            "types_per_record={types_per_record} exceeds the {available} available types"
                        ),
                    );
                }
                if *types_per_record == 0 || *per_type_max == 0 {
                    warn(
                        WarnLevel::Warning,
                        "sampled mode requests no records".to_string(),
                    );
                }
            }
        }

        if self.repair.max_attempts > 10 {
            warn(
                WarnLevel::Warning,
                format!(
                    "repair.max_attempts={} (>10 is unusual)",
                    self.repair.max_attempts
                ),
            );
        }

        if let Some(reviewer) = &self.reviewer {
            if reviewer.model == self.collaborator.model {
                warn(
                    WarnLevel::Warning,
                    format!(
                        "reviewer and generator use the same model '{}'; \
                         consider a different model for review",
                        reviewer.model
                    ),
                );
            }
        }

        if self.streams.success == self.streams.failure {
            warn(
                WarnLevel::Error,
                "streams.success and streams.failure point to the same file".to_string(),
            );
        }

        warnings
    }

    pub fn has_errors(warnings: &[ConfigWarning]) -> bool {
        warnings.iter().any(|w| w.level == WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
