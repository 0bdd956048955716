//! Configuration management
//!
//! Layered TOML configuration: defaults, then user-level
//! `~/.signalforge/signalforge.toml`, then project-level
//! `./.signalforge/signalforge.toml`, then environment overrides.

pub mod loader;
pub mod schema;

pub use loader::{load_config, ConfigLoader};
pub use schema::{
    BatchConfig, BudgetConfig, CacheConfig, DispatchConfig, LoggingConfig, PricingConfig,
    ProviderConfig, ResponseAllowance, SignalforgeConfig, UsageConfig,
};
