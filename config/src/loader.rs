//! Loads `ResilienceConfig` from a TOML file, overlays process environment
//! variables under the `RESILIENCE_` prefix, and falls back to built-in
//! defaults for anything neither source sets.

use std::path::Path;

use thiserror::Error;

use crate::model::ResilienceConfig;

const ENV_PREFIX: &str = "RESILIENCE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, #[source] source: toml::de::Error },
    #[error("config failed validation: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from `path` if given, applies environment
    /// overrides, validates, and returns the result. Passing `None` starts
    /// from built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<ResilienceConfig, ConfigError> {
        let mut config = match path {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading resilience config from file");
                Self::load_from_file(path)?
            }
            None => {
                tracing::info!("no config file given, starting from built-in defaults");
                ResilienceConfig::default()
            }
        };
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<ResilienceConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    /// Overlays a small set of top-level scalars from the environment; the
    /// degradable-operations table and per-service overrides are
    /// file-only, matching the substrate's scope of concrete config file
    /// formats being a binary-level choice, not the core's.
    fn apply_env_overrides(config: &mut ResilienceConfig) {
        if let Some(v) = env_u32("BREAKER_FAILURE_THRESHOLD") {
            config.breaker.failure_threshold = v;
        }
        if let Some(v) = env_u64("BREAKER_CALL_TIMEOUT_SEC") {
            config.breaker.call_timeout_sec = v;
        }
        if let Some(v) = env_u32("BREAKER_HALF_OPEN_MAX") {
            config.breaker.half_open_max = v;
        }
        if let Some(v) = env_f64("BREAKER_BACKOFF_MULTIPLIER") {
            config.breaker.backoff_multiplier = v;
        }
        if let Some(v) = env_u64("BREAKER_MAX_BACKOFF_SEC") {
            config.breaker.max_backoff_sec = v;
        }
        if let Some(v) = env_f64("BREAKER_JITTER_FRACTION") {
            config.breaker.jitter_fraction = v;
        }
        if let Some(v) = env_u64("HEALTH_PROBE_INTERVAL_SEC") {
            config.health.probe_interval_sec = v;
        }
        if let Some(v) = env_u64("HEALTH_PROBE_TIMEOUT_SEC") {
            config.health.probe_timeout_sec = v;
        }
        if let Some(v) = env_u32("FALLBACK_RECOVERY_THRESHOLD") {
            config.fallback.recovery_threshold = v;
        }
        if let Some(v) = env_u32("FALLBACK_MAX_RECOVERY_ATTEMPTS") {
            config.fallback.max_recovery_attempts = v;
        }
        if let Some(v) = env_u64("FALLBACK_DEGRADATION_TIMEOUT_SEC") {
            config.fallback.degradation_timeout_sec = v;
        }
        if let Some(v) = env_u64("LLM_CACHE_TTL_SEC") {
            config.llm.cache_ttl_sec = v;
        }
        if let Some(v) = env_u32("LLM_FAILURE_THRESHOLD") {
            config.llm.failure_threshold = v;
        }
        if let Some(v) = env_string("LLM_PROVIDER_PRIORITY") {
            config.llm.provider_priority = v.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn env_string(suffix: &str) -> Option<String> {
    env_var(suffix)
}

fn env_u32(suffix: &str) -> Option<u32> {
    env_var(suffix).and_then(|v| v.parse().ok())
}

fn env_u64(suffix: &str) -> Option<u64> {
    env_var(suffix).and_then(|v| v.parse().ok())
}

fn env_f64(suffix: &str) -> Option<f64> {
    env_var(suffix).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_with_no_path_returns_defaults() {
        let config = ConfigLoader::load(None).unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn load_from_file_parses_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [breaker]
            failure_threshold = 9
            call_timeout_sec = 60
            half_open_max = 3
            backoff_multiplier = 2.0
            max_backoff_sec = 300
            jitter_fraction = 0.1

            [health]
            probe_interval_sec = 30
            probe_timeout_sec = 10

            [fallback]
            strategy = "immediate"
            recovery_threshold = 3
            max_recovery_attempts = 5
            recovery_probe_interval_sec = 15
            degradation_timeout_sec = 300
            degradable_operations = []

            [llm]
            provider_priority = ["bedrock", "openai", "local"]
            cache_ttl_sec = 3600
            failure_threshold = 3
            default_input_ratio = 0.5
            "#
        )
        .unwrap();

        let config = ConfigLoader::load(Some(file.path())).unwrap();
        assert_eq!(config.breaker.failure_threshold, 9);
    }

    #[test]
    fn env_override_wins_over_file_and_defaults() {
        std::env::set_var("RESILIENCE_BREAKER_FAILURE_THRESHOLD", "11");
        let config = ConfigLoader::load(None).unwrap();
        assert_eq!(config.breaker.failure_threshold, 11);
        std::env::remove_var("RESILIENCE_BREAKER_FAILURE_THRESHOLD");
    }
}
