//! Configuration loading across user and project layers

use signalforge::config::{ConfigLoader, SignalforgeConfig};
use signalforge::SignalError;
use std::time::Duration;
use tempfile::TempDir;

async fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, contents).await.unwrap();
    path
}

#[tokio::test]
async fn test_project_layer_overrides_user_layer() {
    let dir = TempDir::new().unwrap();
    let user = write(
        &dir,
        "user.toml",
        r#"
[budget]
daily_limit = 20000
lifetime_limit = 400000
warning_threshold = 0.9

[provider]
model = "gpt-4o"
"#,
    )
    .await;
    let project = write(
        &dir,
        "project.toml",
        r#"
[budget]
daily_limit = 5000

[cache]
sentiment_ttl_secs = 60
"#,
    )
    .await;

    let config = ConfigLoader::with_paths(Some(user), project).load().await.unwrap();

    assert_eq!(config.budget.daily_limit, 5_000);
    assert_eq!(config.provider.model, "gpt-4o");
    assert_eq!(
        config.cache.ttl_for(signalforge::TaskType::Sentiment),
        Duration::from_secs(60)
    );
    assert_eq!(config.dispatch.max_attempts, 3);
}

#[tokio::test]
async fn test_project_value_equal_to_default_still_overrides_user() {
    let dir = TempDir::new().unwrap();
    let user = write(&dir, "user.toml", "[batch]\nenabled = false\n").await;
    let project = write(&dir, "project.toml", "[batch]\nenabled = true\n").await;

    let config = ConfigLoader::with_paths(Some(user), project).load().await.unwrap();

    assert!(config.batch.enabled);
}

#[tokio::test]
async fn test_partial_project_section_keeps_user_keys() {
    let dir = TempDir::new().unwrap();
    let user = write(
        &dir,
        "user.toml",
        r#"
[provider]
model = "gpt-4o"
base_url = "https://llm.internal.example/v1"
"#,
    )
    .await;
    let project = write(&dir, "project.toml", "[provider]\ntemperature = 0.2\n").await;

    let config = ConfigLoader::with_paths(Some(user), project).load().await.unwrap();

    assert_eq!(config.provider.model, "gpt-4o");
    assert_eq!(config.provider.base_url, "https://llm.internal.example/v1");
    assert_eq!(config.provider.temperature, 0.2);
}

#[tokio::test]
async fn test_missing_files_yield_defaults() {
    let dir = TempDir::new().unwrap();
    let config = ConfigLoader::with_paths(None, dir.path().join("absent.toml"))
        .load()
        .await
        .unwrap();

    let defaults = SignalforgeConfig::default();
    assert_eq!(config.budget, defaults.budget);
    assert_eq!(config.batch, defaults.batch);
}

#[tokio::test]
async fn test_invalid_values_are_rejected() {
    let dir = TempDir::new().unwrap();
    let project = write(
        &dir,
        "project.toml",
        r#"
[batch]
max_batch_size = 0
"#,
    )
    .await;

    let err = ConfigLoader::with_paths(None, project).load().await.unwrap_err();
    assert!(matches!(err, SignalError::Config(_)));
}

#[tokio::test]
async fn test_malformed_toml_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "broken.toml", "[budget\ndaily_limit = ").await;

    let err = ConfigLoader::load_from_path(&path).await.unwrap_err();
    assert!(matches!(err, SignalError::Config(_)));
}
