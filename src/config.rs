use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub endpoints: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub fetch_abi: String,
    pub verify_abi: String,
    pub function_exists: String,
    pub call: String,
    pub estimate_gas: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub default_method: String,
    pub verify_after_fetch: bool,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub settle_delay_ms: u64,
    pub capture_state_diff: bool,
    pub verify_before_call: bool,
    pub estimate_gas_before_write: bool,
    pub history_limit: usize,
    pub gas_debounce_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub allow_write_operations: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            timeout_secs: 30,
            endpoints: EndpointConfig::default(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            fetch_abi: "/contract-abi".to_string(),
            verify_abi: "/verify-abi".to_string(),
            function_exists: "/verify-function".to_string(),
            call: "/call-contract".to_string(),
            estimate_gas: "/estimate-gas".to_string(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_method: "bytecode".to_string(),
            verify_after_fetch: true,
            cache_dir: None,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            capture_state_diff: true,
            verify_before_call: true,
            estimate_gas_before_write: true,
            history_limit: 10,
            gas_debounce_ms: 500,
        }
    }
}

impl OrchestratorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn gas_debounce(&self) -> Duration {
        Duration::from_millis(self.gas_debounce_ms)
    }
}

impl DiscoveryConfig {
    /// Configured cache dir, or the platform cache dir.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("contract-explorer")
                .join("abi-cache")
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    anyhow!("Failed to create config directory {:?}: {}", parent, e)
                })?;
            }
        }

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {:?}: {}", path, e))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub async fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Self {
        let mut config = match path {
            Some(path) => match Self::load_from_file(path).await {
                Ok(config) => {
                    tracing::info!("Loaded configuration from file");
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to load config file, using defaults: {}", e);
                    Self::default()
                }
            },
            None => Self::default(),
        };

        config.apply_env_vars();
        config
    }

    fn apply_env_vars(&mut self) {
        if let Ok(url) = std::env::var("CONTRACT_EXPLORER_API_URL") {
            if !url.trim().is_empty() {
                tracing::info!("Using CONTRACT_EXPLORER_API_URL for the analysis service");
                self.service.base_url = url.trim().to_string();
            }
        }

        if self.service.base_url.contains("localhost") {
            tracing::debug!(
                "Analysis service points at {}, set CONTRACT_EXPLORER_API_URL to use a remote backend",
                self.service.base_url
            );
        }
    }

    /// Get default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("contract-explorer").join("config.toml"))
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let sample_config = r#"# Contract Explorer Configuration File

# Contract analysis backend
[service]
base_url = "http://localhost:3000/api"
timeout_secs = 30

[service.endpoints]
fetch_abi = "/contract-abi"
verify_abi = "/verify-abi"
function_exists = "/verify-function"
call = "/call-contract"
estimate_gas = "/estimate-gas"

# ABI discovery
[discovery]
default_method = "bytecode"   # bytecode | manual-bytecode | transaction | explorer
verify_after_fetch = true
# cache_dir = "/tmp/contract-explorer-cache"

# Call orchestration
[orchestrator]
settle_delay_ms = 2000        # wait before reading post-transaction state
capture_state_diff = true
verify_before_call = true
estimate_gas_before_write = true
history_limit = 10
gas_debounce_ms = 500

[security]
allow_write_operations = false

# Environment variables that can be used:
# CONTRACT_EXPLORER_API_URL - overrides service.base_url
"#;
        sample_config.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sample_config_parses() {
        let config: Config = toml::from_str(&Config::generate_sample()).unwrap();
        assert_eq!(config.orchestrator.history_limit, 10);
        assert_eq!(config.service.endpoints.call, "/call-contract");
        assert!(!config.security.allow_write_operations);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("[security]\nallow_write_operations = true\n").unwrap();
        assert!(config.security.allow_write_operations);
        assert_eq!(config.orchestrator.settle_delay(), Duration::from_millis(2000));
        assert_eq!(config.discovery.default_method, "bytecode");
    }

    #[test]
    fn test_single_key_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            "[orchestrator]\nsettle_delay_ms = 0\n\n[service]\nbase_url = \"http://analysis:8080/api\"\n\n[service.endpoints]\ncall = \"/invoke\"\n\n[discovery]\nverify_after_fetch = false\n",
        )
        .unwrap();

        assert_eq!(config.orchestrator.settle_delay_ms, 0);
        assert!(config.orchestrator.capture_state_diff);
        assert_eq!(config.orchestrator.history_limit, 10);
        assert_eq!(config.service.base_url, "http://analysis:8080/api");
        assert_eq!(config.service.timeout_secs, 30);
        assert_eq!(config.service.endpoints.call, "/invoke");
        assert_eq!(config.service.endpoints.fetch_abi, "/contract-abi");
        assert!(!config.discovery.verify_after_fetch);
        assert_eq!(config.discovery.default_method, "bytecode");
    }

    #[tokio::test]
    async fn test_partial_file_is_not_replaced_by_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[orchestrator]\nsettle_delay_ms = 0\n\n[security]\nallow_write_operations = true\n")
            .await
            .unwrap();

        let config = Config::load_or_default(Some(&path)).await;
        assert_eq!(config.orchestrator.settle_delay_ms, 0);
        assert!(config.security.allow_write_operations);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.orchestrator.settle_delay_ms = 0;
        config.discovery.cache_dir = Some(dir.path().join("cache"));
        config.save_to_file(&path).await.unwrap();

        let loaded = Config::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.orchestrator.settle_delay_ms, 0);
        assert_eq!(loaded.discovery.resolved_cache_dir(), dir.path().join("cache"));
    }

    #[tokio::test]
    async fn test_load_or_default_falls_back() {
        let dir = tempdir().unwrap();
        let config = Config::load_or_default(Some(dir.path().join("missing.toml"))).await;
        assert_eq!(config.orchestrator.history_limit, 10);
    }
}
