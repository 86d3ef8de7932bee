use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use super::reconcile::{self, ReconciledAbi, Verification};
use super::service::{AbiFetchRequest, ContractService};
use super::{utils, AbiSourceTag, ExplorerError};
use crate::config::DiscoveryConfig;

pub const MANUAL_BYTECODE: &str = "manual-bytecode";

/// ABI discovery configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub cache_dir: PathBuf,
    pub verify_after_fetch: bool,
}

impl From<&DiscoveryConfig> for ResolverConfig {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            cache_dir: config.resolved_cache_dir(),
            verify_after_fetch: config.verify_after_fetch,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub method: String,
    pub bypass_cache: bool,
    pub bytecode: Option<String>,
}

impl DiscoveryRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            bypass_cache: false,
            bytecode: None,
        }
    }

    /// Manual bytecode results depend on the submitted code, so they are
    /// never cached.
    fn cacheable(&self) -> bool {
        self.method != MANUAL_BYTECODE
    }
}

/// Fetches, verifies and reconciles contract ABIs, caching the result
/// in memory and on disk.
pub struct AbiResolver {
    service: Arc<dyn ContractService>,
    config: ResolverConfig,
    memory_cache: HashMap<String, ReconciledAbi>,
}

impl AbiResolver {
    pub fn new(service: Arc<dyn ContractService>, config: ResolverConfig) -> Self {
        Self {
            service,
            config,
            memory_cache: HashMap::new(),
        }
    }

    fn cache_key(address: &str, method: &str) -> String {
        format!("{}_{}", method, address.to_lowercase())
    }

    /// Get the canonical ABI for a contract, trying cache first unless bypassed
    pub async fn discover(
        &mut self,
        address: &str,
        request: &DiscoveryRequest,
    ) -> Result<ReconciledAbi, ExplorerError> {
        let address = address.trim();
        if request.method == MANUAL_BYTECODE
            && request.bytecode.as_deref().map_or(true, |b| b.trim().is_empty())
        {
            return Err(ExplorerError::Invalid(
                "manual-bytecode discovery needs the contract bytecode".to_string(),
            ));
        }

        let cache_key = Self::cache_key(address, &request.method);

        if request.cacheable() && !request.bypass_cache {
            if let Some(abi) = self.memory_cache.get(&cache_key) {
                debug!("ABI cache hit for {}", address);
                return Ok(abi.clone());
            }

            if let Ok(abi) = self.load_cached_abi(&cache_key).await {
                debug!("ABI disk cache hit for {}", address);
                self.memory_cache.insert(cache_key, abi.clone());
                return Ok(abi);
            }
        }

        info!("Discovering ABI for {} via {}", address, request.method);
        let abi = self.fetch_and_reconcile(address, request).await?;

        if request.cacheable() {
            if let Err(e) = self.cache_abi(&cache_key, &abi).await {
                warn!("Failed to cache ABI for {}: {}", address, e);
            }
            self.memory_cache.insert(cache_key, abi.clone());
        }

        Ok(abi)
    }

    async fn fetch_and_reconcile(
        &self,
        address: &str,
        request: &DiscoveryRequest,
    ) -> Result<ReconciledAbi, ExplorerError> {
        let discovery_error = |reason: String| ExplorerError::Discovery {
            address: address.to_string(),
            reason,
        };

        let response = self
            .service
            .fetch_abi(&AbiFetchRequest {
                contract_address: address.to_string(),
                analysis_method: request.method.clone(),
                bypass_cache: request.bypass_cache,
                bytecode: request.bytecode.clone(),
                timestamp: request.bypass_cache.then(|| Utc::now().timestamp_millis()),
            })
            .await
            .map_err(|e| discovery_error(utils::interpret_discovery_error(&e.message(), address)))?;

        let discovered = reconcile::parse_signatures(&response.function_signatures);
        if response.abi.is_empty() && discovered.is_empty() {
            return Err(discovery_error(
                response
                    .message
                    .unwrap_or_else(|| "the analysis returned no functions".to_string()),
            ));
        }
        if let Some(message) = &response.message {
            info!("ABI service: {}", message);
        }

        let source = match response.source.as_deref() {
            Some(label) => AbiSourceTag::from_label(label),
            None => AbiSourceTag::from_label(&request.method),
        };

        let preliminary = reconcile::reconcile(response.abi, source, Verification::NotAttempted);
        let functions = reconcile::merge_discovered(&preliminary.functions, discovered);

        let verification = if self.config.verify_after_fetch {
            match self.service.verify_abi(address, &functions).await {
                Ok(result) => Verification::Completed(result),
                Err(e) => Verification::Failed(e.message()),
            }
        } else {
            Verification::NotAttempted
        };

        let items = functions
            .into_iter()
            .chain(preliminary.events)
            .chain(preliminary.constructors)
            .collect();
        let abi = reconcile::reconcile(items, source, verification);
        info!(
            "Discovered {} functions for {} ({} verified, source {})",
            abi.functions.len(),
            address,
            abi.verified_count(),
            abi.source
        );
        Ok(abi)
    }

    /// Load ABI from disk cache
    async fn load_cached_abi(&self, cache_key: &str) -> Result<ReconciledAbi> {
        let cache_path = self.config.cache_dir.join(format!("{}.json", cache_key));

        if !cache_path.exists() {
            return Err(anyhow!("Cache file does not exist"));
        }

        let content = fs::read_to_string(&cache_path)
            .await
            .map_err(|e| anyhow!("Failed to read cache file: {}", e))?;

        let abi: ReconciledAbi = serde_json::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse cached ABI: {}", e))?;

        Ok(abi)
    }

    /// Save ABI to disk cache
    async fn cache_abi(&self, cache_key: &str, abi: &ReconciledAbi) -> Result<()> {
        if !self.config.cache_dir.exists() {
            fs::create_dir_all(&self.config.cache_dir)
                .await
                .map_err(|e| anyhow!("Failed to create cache directory: {}", e))?;
        }

        let cache_path = self.config.cache_dir.join(format!("{}.json", cache_key));
        let content = serde_json::to_string_pretty(abi)
            .map_err(|e| anyhow!("Failed to serialize ABI: {}", e))?;

        fs::write(&cache_path, content)
            .await
            .map_err(|e| anyhow!("Failed to write cache file: {}", e))?;

        debug!("Cached ABI to {:?}", cache_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethereum::service::mock::{MockService, Recorded};
    use crate::ethereum::service::{AbiFetchResponse, AbiVerifyResponse};
    use crate::ethereum::{FunctionDescriptor, Param, StateMutability};
    use serde_json::json;
    use tempfile::tempdir;

    const TOKEN: &str = "0x742d35Cc6435C9c1c72c5E7b18BaB7e1DB7a5d6e";

    fn token_response() -> AbiFetchResponse {
        serde_json::from_value(json!({
            "abi": [
                {"type": "function", "name": "balanceOf",
                 "inputs": [{"name": "owner", "type": "address"}],
                 "outputs": [{"type": "uint256"}], "stateMutability": "view"},
                {"type": "event", "name": "Transfer", "inputs": []}
            ],
            "source": "bytecode",
            "functionSignatures": ["transfer(address,uint256)", "balanceOf(address)"]
        }))
        .unwrap()
    }

    fn resolver(service: &Arc<MockService>, dir: &std::path::Path) -> AbiResolver {
        AbiResolver::new(
            service.clone(),
            ResolverConfig {
                cache_dir: dir.to_path_buf(),
                verify_after_fetch: true,
            },
        )
    }

    fn fetch_count(service: &MockService) -> usize {
        service
            .recorded()
            .iter()
            .filter(|r| matches!(r, Recorded::FetchAbi(_)))
            .count()
    }

    #[tokio::test]
    async fn test_discovery_merges_and_verifies() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MockService::default());
        service.fetch.lock().unwrap().push_back(Ok(token_response()));
        service.verify.lock().unwrap().push_back(Ok(AbiVerifyResponse {
            verified_functions: vec![FunctionDescriptor::new("balanceOf")
                .with_inputs(vec![Param::new("", "address")])],
            total: 2,
            verified: 1,
        }));

        let mut resolver = resolver(&service, dir.path());
        let abi = resolver
            .discover(TOKEN, &DiscoveryRequest::new("bytecode"))
            .await
            .unwrap();

        let signatures: Vec<_> = abi.functions.iter().map(|f| f.signature()).collect();
        assert_eq!(signatures, ["balanceOf(address)", "transfer(address,uint256)"]);
        assert_eq!(abi.functions[0].verified, Some(true));
        assert_eq!(abi.functions[1].verified, Some(false));
        assert_eq!(abi.functions[1].state_mutability, Some(StateMutability::Nonpayable));
        assert_eq!(abi.events.len(), 1);
        assert_eq!(abi.source, AbiSourceTag::Bytecode);
        assert!(service.recorded().contains(&Recorded::VerifyAbi(2)));
    }

    #[tokio::test]
    async fn test_cache_hit_and_bypass() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MockService::default());
        service.fetch.lock().unwrap().push_back(Ok(token_response()));
        service.fetch.lock().unwrap().push_back(Ok(token_response()));

        let mut resolver = resolver(&service, dir.path());
        let request = DiscoveryRequest::new("bytecode");
        resolver.discover(TOKEN, &request).await.unwrap();
        resolver.discover(TOKEN, &request).await.unwrap();
        assert_eq!(fetch_count(&service), 1);

        // a fresh resolver reads the disk cache
        let mut cold = AbiResolver::new(
            service.clone(),
            ResolverConfig {
                cache_dir: dir.path().to_path_buf(),
                verify_after_fetch: true,
            },
        );
        cold.discover(&TOKEN.to_lowercase(), &request).await.unwrap();
        assert_eq!(fetch_count(&service), 1);

        let bypass = DiscoveryRequest {
            bypass_cache: true,
            ..request
        };
        resolver.discover(TOKEN, &bypass).await.unwrap();
        assert_eq!(fetch_count(&service), 2);
    }

    #[tokio::test]
    async fn test_verification_failure_is_a_warning() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MockService::default());
        service.fetch.lock().unwrap().push_back(Ok(token_response()));

        let mut resolver = resolver(&service, dir.path());
        let abi = resolver
            .discover(TOKEN, &DiscoveryRequest::new("bytecode"))
            .await
            .unwrap();

        assert_eq!(abi.functions.len(), 2);
        assert_eq!(abi.warnings.len(), 1);
        assert!(abi.functions.iter().all(|f| f.verified.is_none()));
    }

    #[tokio::test]
    async fn test_empty_discovery_is_an_error() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MockService::default());
        service.fetch.lock().unwrap().push_back(Ok(AbiFetchResponse::default()));

        let mut resolver = resolver(&service, dir.path());
        let err = resolver
            .discover(TOKEN, &DiscoveryRequest::new("transaction"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExplorerError::Discovery { .. }));
        assert!(err.to_string().contains("bytecode manually"));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_a_discovery_error() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MockService::default());
        service
            .fetch
            .lock()
            .unwrap()
            .push_back(Err(MockService::api_error("no bytecode at address")));

        let mut resolver = resolver(&service, dir.path());
        let err = resolver
            .discover(TOKEN, &DiscoveryRequest::new("bytecode"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExplorerError::Discovery { .. }));
    }

    #[tokio::test]
    async fn test_manual_bytecode_requires_code_and_skips_cache() {
        let dir = tempdir().unwrap();
        let service = Arc::new(MockService::default());
        service.fetch.lock().unwrap().push_back(Ok(token_response()));
        service.fetch.lock().unwrap().push_back(Ok(token_response()));
        let mut resolver = resolver(&service, dir.path());

        let missing = DiscoveryRequest::new(MANUAL_BYTECODE);
        assert!(matches!(
            resolver.discover(TOKEN, &missing).await,
            Err(ExplorerError::Invalid(_))
        ));

        let request = DiscoveryRequest {
            bytecode: Some("0x6080".to_string()),
            ..DiscoveryRequest::new(MANUAL_BYTECODE)
        };
        let abi = resolver.discover(TOKEN, &request).await.unwrap();
        // source label from the response wins over the method
        assert_eq!(abi.source, AbiSourceTag::Bytecode);
        resolver.discover(TOKEN, &request).await.unwrap();
        assert_eq!(fetch_count(&service), 2);
    }
}
