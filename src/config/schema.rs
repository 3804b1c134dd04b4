use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub limits: Limits,
    pub recipes: RecipeConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
        }
    }
}

/// Store-layer guard rails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_operations_per_message: usize,
    pub max_pending_entries: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_operations_per_message: 1024,
            max_pending_entries: 4096,
        }
    }
}

/// How recipe normalization treats slots that nothing produces or
/// consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanSlotPolicy {
    /// Orphan slots invalidate the recipe.
    Strict,
    /// Orphan slots are logged and tolerated.
    #[default]
    Lenient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub orphan_slots: OrphanSlotPolicy,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            orphan_slots: OrphanSlotPolicy::Lenient,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub logging: LoggingConfigOverride,
    pub limits: LimitsOverride,
    pub recipes: RecipeConfigOverride,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LimitsOverride {
    pub max_operations_per_message: Option<usize>,
    pub max_pending_entries: Option<usize>,
}

impl LimitsOverride {
    pub fn apply_to(&self, target: &mut Limits) {
        if let Some(limit) = self.max_operations_per_message {
            target.max_operations_per_message = limit;
        }
        if let Some(limit) = self.max_pending_entries {
            target.max_pending_entries = limit;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecipeConfigOverride {
    pub orphan_slots: Option<OrphanSlotPolicy>,
}

impl RecipeConfigOverride {
    pub fn apply_to(&self, target: &mut RecipeConfig) {
        if let Some(policy) = self.orphan_slots {
            target.orphan_slots = policy;
        }
    }
}

impl ConfigLayer {
    pub fn apply_to(&self, target: &mut Config) {
        self.logging.apply_to(&mut target.logging);
        self.limits.apply_to(&mut target.limits);
        self.recipes.apply_to(&mut target.recipes);
    }
}
