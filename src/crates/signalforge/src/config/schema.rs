//! Configuration schema for signalforge

use crate::error::{Result, SignalError};
use crate::task::TaskType;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Main signalforge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SignalforgeConfig {
    /// Token budget limits
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Provider endpoint and model
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Retry, timeout and estimation settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Result cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Batch window settings
    #[serde(default)]
    pub batch: BatchConfig,

    /// Token pricing for cost records
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Usage record sink
    #[serde(default)]
    pub usage: UsageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Budget limits. A limit of zero disables that scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,

    #[serde(default = "default_lifetime_limit")]
    pub lifetime_limit: u64,

    /// Fraction of a limit at which status reports a warning (0.0-1.0]
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

fn default_daily_limit() -> u64 {
    50_000
}

fn default_lifetime_limit() -> u64 {
    1_000_000
}

fn default_warning_threshold() -> f64 {
    0.8
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            lifetime_limit: default_lifetime_limit(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// API base URL of an OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Inline API key (supports `${VAR}` interpolation); takes precedence over `api_key_env`
    #[serde(default)]
    pub api_key: Option<String>,

    /// Temperature for generation (0.0-2.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// HTTP client timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
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

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            api_key: None,
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Total attempts per call, first try included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Upper bound for a single provider attempt
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Deadline applied to tasks submitted without one
    #[serde(default)]
    pub default_deadline_ms: Option<u64>,

    /// Reply token allowance added to reservation estimates
    #[serde(default)]
    pub response_tokens: ResponseAllowance,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
            attempt_timeout_ms: default_attempt_timeout_ms(),
            default_deadline_ms: None,
            response_tokens: ResponseAllowance::default(),
        }
    }
}

impl DispatchConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

/// Expected reply size per task type, in tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseAllowance {
    #[serde(default = "default_content_tokens")]
    pub content: u64,
    #[serde(default = "default_sentiment_tokens")]
    pub sentiment: u64,
    #[serde(default = "default_hashtag_tokens")]
    pub hashtags: u64,
    #[serde(default = "default_schedule_tokens")]
    pub schedule: u64,
}

fn default_content_tokens() -> u64 {
    400
}

fn default_sentiment_tokens() -> u64 {
    120
}

fn default_hashtag_tokens() -> u64 {
    150
}

fn default_schedule_tokens() -> u64 {
    200
}

impl Default for ResponseAllowance {
    fn default() -> Self {
        Self {
            content: default_content_tokens(),
            sentiment: default_sentiment_tokens(),
            hashtags: default_hashtag_tokens(),
            schedule: default_schedule_tokens(),
        }
    }
}

impl ResponseAllowance {
    pub fn for_type(&self, task_type: TaskType) -> u64 {
        match task_type {
            TaskType::ContentGen => self.content,
            TaskType::Sentiment => self.sentiment,
            TaskType::Hashtag => self.hashtags,
            TaskType::Schedule => self.schedule,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum stored entries before eviction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_content_ttl")]
    pub content_ttl_secs: u64,

    #[serde(default = "default_sentiment_ttl")]
    pub sentiment_ttl_secs: u64,

    #[serde(default = "default_hashtags_ttl")]
    pub hashtags_ttl_secs: u64,

    #[serde(default = "default_schedule_ttl")]
    pub schedule_ttl_secs: u64,
}

fn default_max_entries() -> usize {
    1_024
}

fn default_content_ttl() -> u64 {
    30 * 60
}

fn default_sentiment_ttl() -> u64 {
    60 * 60
}

fn default_hashtags_ttl() -> u64 {
    6 * 60 * 60
}

fn default_schedule_ttl() -> u64 {
    12 * 60 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            content_ttl_secs: default_content_ttl(),
            sentiment_ttl_secs: default_sentiment_ttl(),
            hashtags_ttl_secs: default_hashtags_ttl(),
            schedule_ttl_secs: default_schedule_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, task_type: TaskType) -> Duration {
        let secs = match task_type {
            TaskType::ContentGen => self.content_ttl_secs,
            TaskType::Sentiment => self.sentiment_ttl_secs,
            TaskType::Hashtag => self.hashtags_ttl_secs,
            TaskType::Schedule => self.schedule_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Batch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Collection window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_window_ms() -> u64 {
    25
}

fn default_max_batch_size() -> usize {
    8
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: default_window_ms(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Token pricing in currency units per 1000 tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    #[serde(default = "default_input_price")]
    pub input_per_1k: f64,

    #[serde(default = "default_output_price")]
    pub output_per_1k: f64,
}

fn default_input_price() -> f64 {
    0.00015
}

fn default_output_price() -> f64 {
    0.0006
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_1k: default_input_price(),
            output_per_1k: default_output_price(),
        }
    }
}

impl PricingConfig {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Usage record sink
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UsageConfig {
    /// Append-only JSON lines file; in-memory log when unset
    #[serde(default)]
    pub log_path: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SignalforgeConfig {
    /// Build a config from a layered TOML table. Missing keys take defaults.
    pub fn from_table(table: toml::Table) -> Result<Self> {
        Ok(toml::Value::Table(table).try_into()?)
    }

    /// Resolve `${VAR}` references in string fields
    pub fn resolve_env_vars(&mut self) {
        if let Some(ref api_key) = self.provider.api_key {
            self.provider.api_key = Some(Self::expand_env_var(api_key));
        }
        self.provider.base_url = Self::expand_env_var(&self.provider.base_url);
        if let Some(ref path) = self.usage.log_path {
            self.usage.log_path = Some(Self::expand_env_var(path));
        }
    }

    /// Apply `SIGNALFORGE_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_override(&lookup, "SIGNALFORGE_DAILY_LIMIT") {
            self.budget.daily_limit = value;
        }
        if let Some(value) = parse_override(&lookup, "SIGNALFORGE_LIFETIME_LIMIT") {
            self.budget.lifetime_limit = value;
        }
        if let Some(value) = parse_override(&lookup, "SIGNALFORGE_WARNING_THRESHOLD") {
            self.budget.warning_threshold = value;
        }
        if let Some(model) = lookup("SIGNALFORGE_MODEL") {
            self.provider.model = model;
        }
        if let Some(base_url) = lookup("SIGNALFORGE_BASE_URL") {
            self.provider.base_url = base_url;
        }
        if let Some(key_env) = lookup("SIGNALFORGE_API_KEY_ENV") {
            self.provider.api_key_env = key_env;
        }
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<()> {
        let threshold = self.budget.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(SignalError::Config(format!(
                "budget.warning_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(SignalError::Config(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.dispatch.multiplier < 1.0 {
            return Err(SignalError::Config(format!(
                "dispatch.multiplier must be >= 1.0, got {}",
                self.dispatch.multiplier
            )));
        }
        if self.dispatch.attempt_timeout_ms == 0 {
            return Err(SignalError::Config(
                "dispatch.attempt_timeout_ms must be positive".to_string(),
            ));
        }
        if self.batch.max_batch_size == 0 {
            return Err(SignalError::Config(
                "batch.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(SignalError::Config(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Expand environment variable in a string
    ///
    /// Supports ${VAR_NAME} syntax
    fn expand_env_var(value: &str) -> String {
        if value.starts_with("${") && value.ends_with('}') {
            let var_name = &value[2..value.len() - 1];
            std::env::var(var_name).unwrap_or_else(|_| value.to_string())
        } else {
            value.to_string()
        }
    }
}

/// Merge `overlay` into `base` key by key (overlay takes precedence)
///
/// Nested tables merge recursively, so a layer only overrides the keys it
/// actually sets. Any other value, arrays included, replaces the lower one.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(lower)), toml::Value::Table(upper)) => {
                merge_tables(lower, upper);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_override<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SignalforgeConfig::default();
        assert_eq!(config.budget.daily_limit, 50_000);
        assert_eq!(config.budget.warning_threshold, 0.8);
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.batch.window(), Duration::from_millis(25));
        assert_eq!(config.batch.max_batch_size, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_defaults_per_type() {
        let cache = CacheConfig::default();
        assert_eq!(cache.ttl_for(TaskType::ContentGen), Duration::from_secs(1800));
        assert_eq!(cache.ttl_for(TaskType::Sentiment), Duration::from_secs(3600));
        assert_eq!(cache.ttl_for(TaskType::Hashtag), Duration::from_secs(6 * 3600));
        assert_eq!(cache.ttl_for(TaskType::Schedule), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let toml_str = r#"
[budget]
daily_limit = 1000

[batch]
window_ms = 50
"#;
        let config: SignalforgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.budget.daily_limit, 1000);
        assert_eq!(config.budget.lifetime_limit, 1_000_000);
        assert_eq!(config.batch.window_ms, 50);
        assert!(config.batch.enabled);
        assert_eq!(config.dispatch.response_tokens.content, 400);
    }

    fn table(raw: &str) -> toml::Table {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn test_merge_tables_keeps_unset_keys() {
        let mut base = table("[provider]\nmodel = \"gpt-4o\"\n[cache]\nenabled = false\n");
        merge_tables(&mut base, table("[provider]\ntemperature = 0.2\n"));

        let config = SignalforgeConfig::from_table(base).unwrap();
        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.provider.temperature, 0.2);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_merge_tables_explicit_default_wins() {
        let mut base = table("[batch]\nenabled = false\nwindow_ms = 80\n");
        merge_tables(&mut base, table("[batch]\nenabled = true\n"));

        let config = SignalforgeConfig::from_table(base).unwrap();
        assert!(config.batch.enabled);
        assert_eq!(config.batch.window_ms, 80);
    }

    #[test]
    fn test_from_empty_table_is_default() {
        let config = SignalforgeConfig::from_table(toml::Table::new()).unwrap();
        assert_eq!(config, SignalforgeConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SIGNALFORGE_DAILY_LIMIT", "2000"),
            ("SIGNALFORGE_WARNING_THRESHOLD", "0.9"),
            ("SIGNALFORGE_LIFETIME_LIMIT", "not-a-number"),
            ("SIGNALFORGE_MODEL", "llama-3-70b"),
            ("SIGNALFORGE_API_KEY_ENV", "GATEWAY_KEY"),
        ]
        .into_iter()
        .collect();

        let mut config = SignalforgeConfig::default();
        config.apply_env_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.budget.daily_limit, 2000);
        assert_eq!(config.budget.warning_threshold, 0.9);
        assert_eq!(config.budget.lifetime_limit, 1_000_000);
        assert_eq!(config.provider.model, "llama-3-70b");
        assert_eq!(config.provider.api_key_env, "GATEWAY_KEY");
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("SIGNALFORGE_TEST_KEY", "sk-test");
        let mut config = SignalforgeConfig::default();
        config.provider.api_key = Some("${SIGNALFORGE_TEST_KEY}".to_string());
        config.resolve_env_vars();
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SignalforgeConfig::default();
        config.budget.warning_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = SignalforgeConfig::default();
        config.budget.warning_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = SignalforgeConfig::default();
        config.dispatch.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = SignalforgeConfig::default();
        config.batch.max_batch_size = 0;
        assert!(matches!(config.validate(), Err(SignalError::Config(_))));
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = PricingConfig {
            input_per_1k: 0.5,
            output_per_1k: 1.5,
        };
        assert!((pricing.cost(2000, 1000) - 2.5).abs() < 1e-9);
    }
}
