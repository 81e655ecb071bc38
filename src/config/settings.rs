use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::remote::RetryPolicy;
use crate::util::paths::config_path;

/// Example configuration file contents (bundled with the binary)
pub const EXAMPLE_CONFIG: &str = include_str!("config.toml.example");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// GitHub token used for every remote request
    pub github_token: Option<String>,
    /// API base URL override for GitHub Enterprise
    pub api_base: Option<String>,
    /// Retry budget for transient remote failures
    pub retry: RetryPolicy,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github_token: None,
            api_base: None,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// TOML representation of the [github] section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlGithubConfig {
    pub token: Option<String>,
    pub api_base: Option<String>,
}

/// TOML representation of the [sync] section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlSyncConfig {
    pub max_attempts: Option<u32>,
    pub retry_base_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

/// TOML representation of the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub github: Option<TomlGithubConfig>,
    pub sync: Option<TomlSyncConfig>,
}

impl Config {
    /// Load configuration from file, merging with defaults. A token from the
    /// config file wins over the GITHUB_TOKEN environment variable.
    pub fn load() -> Self {
        let config_file = config_path();

        // Create example config on first run
        if !config_file.exists() {
            Self::create_default_config(&config_file);
        }

        let mut config = Config::default();
        if let Ok(contents) = fs::read_to_string(&config_file) {
            if let Ok(toml_config) = toml::from_str::<TomlConfig>(&contents) {
                config.apply(toml_config);
            }
        }

        if config.github_token.is_none() {
            config.github_token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        }

        config
    }

    fn apply(&mut self, toml_config: TomlConfig) {
        if let Some(github) = toml_config.github {
            if let Some(token) = github.token {
                self.github_token = Some(token);
            }
            if let Some(api_base) = github.api_base {
                self.api_base = Some(api_base);
            }
        }

        if let Some(sync) = toml_config.sync {
            if let Some(max_attempts) = sync.max_attempts {
                self.retry.max_attempts = max_attempts;
            }
            if let Some(base_ms) = sync.retry_base_ms {
                self.retry.base_delay = Duration::from_millis(base_ms);
            }
            if let Some(max_ms) = sync.retry_max_ms {
                self.retry.max_delay = Duration::from_millis(max_ms);
            }
            if let Some(secs) = sync.request_timeout_secs {
                self.request_timeout = Duration::from_secs(secs);
            }
        }
    }

    /// Create the default config file from the bundled example
    fn create_default_config(path: &PathBuf) {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!("Failed to create config directory: {}", e);
                    return;
                }
            }
        }

        if let Err(e) = fs::write(path, EXAMPLE_CONFIG) {
            eprintln!("Failed to write default config: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let parsed: TomlConfig = toml::from_str(EXAMPLE_CONFIG).unwrap();
        // Everything in the example is commented out
        assert!(parsed.github.is_none() || parsed.github.unwrap().token.is_none());
    }

    #[test]
    fn test_partial_config_merges_over_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [github]
            token = "ghp_test"

            [sync]
            max_attempts = 2
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply(toml_config);

        assert_eq!(config.github_token.as_deref(), Some("ghp_test"));
        assert_eq!(config.retry.max_attempts, 2);
        // Untouched fields keep their defaults
        assert_eq!(config.retry.base_delay, RetryPolicy::default().base_delay);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_sync_durations_from_millis() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [sync]
            retry_base_ms = 250
            retry_max_ms = 5000
            request_timeout_secs = 10
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply(toml_config);

        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_millis(5000));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }
}
