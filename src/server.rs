use anyhow::Result;
use rmcp::{
    model::{ServerCapabilities, ServerInfo},
    tool,
    transport::stdio,
    ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    ethereum::{
        abi::{AbiResolver, DiscoveryRequest, ResolverConfig},
        format,
        grouper::{self, Groups},
        orchestrator::{CallOrchestrator, OrchestratorOptions, PreparedCall},
        service::{CallParameter, ContractService, GasEstimateRequest, HttpContractService},
        session::{GasEstimate, GasEstimator, Session},
        utils, ExplorerError, FunctionDescriptor,
    },
};

#[derive(Clone)]
pub struct ContractExplorerServer {
    session: Arc<Mutex<Option<Session>>>,
    resolver: Arc<Mutex<AbiResolver>>,
    orchestrator: Arc<CallOrchestrator>,
    service: Arc<dyn ContractService>,
    gas: Arc<GasEstimator>,
    config: Arc<Config>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct OpenContractRequest {
    address: String,
    /// Discover the ABI right away (default true)
    discover: Option<bool>,
    method: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct DiscoverAbiRequest {
    /// bytecode, transaction, explorer or manual-bytecode
    method: Option<String>,
    bypass_cache: Option<bool>,
    bytecode: Option<String>,
    /// Add the discovered functions to the current list instead of replacing it
    merge: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct SelectFunctionRequest {
    /// Function name or full signature such as `transfer(address,uint256)`
    function: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct SetInputRequest {
    /// Input name or zero-based position
    input: String,
    value: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct CallFunctionRequest {
    function: Option<String>,
    /// Positional values; replaces any inputs already bound
    parameters: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct ReplayHistoryRequest {
    /// Zero-based, newest first
    index: usize,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct FormatValueRequest {
    /// Field name used to pick amount and timestamp formatting
    key: String,
    value: Value,
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "Failed to serialize result".to_string())
}

fn describe(function: &FunctionDescriptor) -> Value {
    json!({
        "signature": function
            .human_readable_signature
            .clone()
            .unwrap_or_else(|| function.derive_human_readable()),
        "verified": function.verified,
    })
}

fn describe_groups(groups: &Groups) -> Vec<Value> {
    groups
        .iter()
        .map(|(category, functions)| {
            json!({
                "category": category.label(),
                "functions": functions.iter().map(describe).collect::<Vec<_>>(),
            })
        })
        .collect()
}

impl ContractExplorerServer {
    pub fn new(config: Config) -> Result<Self> {
        let service = Arc::new(HttpContractService::new(config.service.clone())?);
        Ok(Self::with_service(config, service))
    }

    fn with_service(config: Config, service: Arc<dyn ContractService>) -> Self {
        let resolver = AbiResolver::new(service.clone(), ResolverConfig::from(&config.discovery));
        let orchestrator = CallOrchestrator::new(
            service.clone(),
            OrchestratorOptions::from_config(
                &config.orchestrator,
                config.security.allow_write_operations,
            ),
        );
        let gas = GasEstimator::new(config.orchestrator.gas_debounce());

        Self {
            session: Arc::new(Mutex::new(None)),
            resolver: Arc::new(Mutex::new(resolver)),
            orchestrator: Arc::new(orchestrator),
            service,
            gas: Arc::new(gas),
            config: Arc::new(config),
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!("Starting Contract Explorer Server");

        let service = self.clone().serve(stdio()).await?;

        info!("Contract Explorer Server started successfully");
        let _ = service.waiting().await;
        Ok(())
    }

    /// Fetches without holding the session lock; the result is dropped if
    /// the contract changed or another discovery started meanwhile.
    async fn discover(&self, request: DiscoveryRequest, merge: bool) -> Result<Value, ExplorerError> {
        let ticket = {
            let mut guard = self.session.lock().await;
            guard.as_mut().ok_or(ExplorerError::NoContract)?.begin_fetch()
        };

        let abi = {
            let mut resolver = self.resolver.lock().await;
            resolver.discover(ticket.address(), &request).await?
        };

        let mut summary = json!({
            "address": ticket.address(),
            "source": abi.source,
            "functions": abi.functions.len(),
            "verified": abi.verified_count(),
            "events": abi.events.len(),
            "warnings": abi.warnings,
        });

        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(ExplorerError::NoContract);
        };
        let applied = if merge {
            session.merge_functions(&ticket, abi.functions).map(|added| {
                summary["added"] = json!(added);
            })
        } else {
            session.apply_abi(&ticket, abi).then_some(())
        };
        if applied.is_none() {
            warn!("Discarded ABI for {}: a newer request superseded it", ticket.address());
            return Ok(json!({ "discarded": true, "address": ticket.address() }));
        }
        Ok(summary)
    }

    /// Runs a call with the session unlocked, so readers are not blocked by
    /// verification, probes or the settle delay.
    async fn run_detached(&self, call: PreparedCall) -> String {
        let mut outcome = self.orchestrator.execute(&call).await;

        let recorded = {
            let mut guard = self.session.lock().await;
            guard
                .as_mut()
                .map_or(false, |session| call.record(session, &outcome))
        };
        if !recorded && outcome.history_entry().is_some() {
            outcome
                .warnings
                .push("The contract was closed or changed during the call; not added to history".to_string());
        }

        if let Some(error) = &outcome.error {
            error!("Call to {} failed: {}", outcome.signature, error);
        }
        to_json(&outcome)
    }

    fn discovery_request(&self, method: Option<String>) -> DiscoveryRequest {
        DiscoveryRequest::new(method.unwrap_or_else(|| self.config.discovery.default_method.clone()))
    }
}

#[tool(tool_box)]
impl ContractExplorerServer {
    #[tool(description = "Open a contract by address and discover its functions")]
    async fn open_contract(&self, #[tool(aggr)] request: OpenContractRequest) -> String {
        if let Err(e) = utils::validate_address(&request.address) {
            return format!("Error: {}", e);
        }

        {
            let mut guard = self.session.lock().await;
            match guard.as_mut() {
                Some(session) => {
                    if session.reset_for(&request.address) {
                        info!("Switched contract to {}", request.address.trim());
                    }
                }
                None => {
                    *guard = Some(Session::open(
                        &request.address,
                        self.config.orchestrator.history_limit,
                    ));
                }
            }
        }

        if !request.discover.unwrap_or(true) {
            return format!("Opened {}", request.address.trim());
        }

        match self.discover(self.discovery_request(request.method), false).await {
            Ok(summary) => to_json(&summary),
            Err(e) => {
                error!("Failed to discover ABI: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Re-run ABI discovery for the open contract")]
    async fn discover_abi(&self, #[tool(aggr)] request: DiscoverAbiRequest) -> String {
        let discovery = DiscoveryRequest {
            bypass_cache: request.bypass_cache.unwrap_or(false),
            bytecode: request.bytecode,
            ..self.discovery_request(request.method)
        };

        match self.discover(discovery, request.merge.unwrap_or(false)).await {
            Ok(summary) => to_json(&summary),
            Err(e) => {
                error!("Failed to discover ABI: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "List the open contract's functions, grouped into read and write categories")]
    async fn list_functions(&self) -> String {
        let guard = self.session.lock().await;
        let Some(session) = guard.as_ref() else {
            return format!("Error: {}", ExplorerError::NoContract);
        };

        let grouped = grouper::group_functions(&session.functions());
        let abi = session.abi();
        to_json(&json!({
            "address": session.contract_address(),
            "source": abi.as_ref().map(|abi| abi.source),
            "events": abi
                .as_ref()
                .map(|abi| abi.events.iter().map(|e| e.name.clone()).collect::<Vec<_>>())
                .unwrap_or_default(),
            "read": describe_groups(&grouped.read),
            "write": describe_groups(&grouped.write),
        }))
    }

    #[tool(description = "Select a function to call; its inputs reset to empty values")]
    async fn select_function(&self, #[tool(aggr)] request: SelectFunctionRequest) -> String {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return format!("Error: {}", ExplorerError::NoContract);
        };

        match session.select_function(&request.function) {
            Ok(function) => to_json(&json!({
                "selected": describe(function),
                "read_only": crate::ethereum::classifier::is_read_only(function),
                "inputs": function.inputs,
            })),
            Err(e) => format!("Error: {}", e),
        }
    }

    #[tool(description = "Bind a value to an input of the selected function")]
    async fn set_input(&self, #[tool(aggr)] request: SetInputRequest) -> String {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return format!("Error: {}", ExplorerError::NoContract);
        };

        match session.set_input(&request.input, &request.value) {
            Ok(()) => to_json(&session.inputs()),
            Err(e) => format!("Error: {}", e),
        }
    }

    #[tool(description = "Call the selected function (or the named one) and report the result, state changes and history")]
    async fn call_function(&self, #[tool(aggr)] request: CallFunctionRequest) -> String {
        let call = {
            let mut guard = self.session.lock().await;
            let Some(session) = guard.as_mut() else {
                return format!("Error: {}", ExplorerError::NoContract);
            };

            if let Some(function) = &request.function {
                if let Err(e) = session.ensure_selected(function) {
                    return format!("Error: {}", e);
                }
            }
            if let Some(parameters) = &request.parameters {
                if let Err(e) = session.bind_all(parameters) {
                    return format!("Error: {}", e);
                }
            }

            match PreparedCall::selected(session) {
                Ok(call) => call,
                Err(e) => return format!("Error: {}", e),
            }
        };

        self.run_detached(call).await
    }

    #[tool(description = "Estimate gas for the selected function with its current inputs")]
    async fn estimate_gas(&self) -> String {
        let request = {
            let guard = self.session.lock().await;
            let Some(session) = guard.as_ref() else {
                return format!("Error: {}", ExplorerError::NoContract);
            };
            let Some(function) = session.selected() else {
                return format!("Error: {}", ExplorerError::NoFunctionSelected);
            };
            GasEstimateRequest {
                contract_address: session.contract_address().to_string(),
                function_name: function.name.clone(),
                parameters: session.inputs().iter().map(CallParameter::from).collect(),
                abi: session.functions().to_vec(),
            }
        };

        match self.gas.estimate(self.service.as_ref(), request).await {
            GasEstimate::Estimated(gas) => format!("Estimated gas: {} units", gas),
            GasEstimate::Superseded => "Superseded by a newer estimate".to_string(),
            GasEstimate::Failed(e) => {
                error!("Failed to estimate gas: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Show recent calls, newest first")]
    async fn get_history(&self) -> String {
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) => to_json(&*session.history().snapshot()),
            None => format!("Error: {}", ExplorerError::NoContract),
        }
    }

    #[tool(description = "Re-run a history entry with its original parameters")]
    async fn replay_history(&self, #[tool(aggr)] request: ReplayHistoryRequest) -> String {
        let call = {
            let guard = self.session.lock().await;
            let Some(session) = guard.as_ref() else {
                return format!("Error: {}", ExplorerError::NoContract);
            };
            match PreparedCall::replay(session, request.index) {
                Ok(call) => call,
                Err(e) => return format!("Error: {}", e),
            }
        };

        self.run_detached(call).await
    }

    #[tool(description = "Format a returned value for display (addresses, hashes, token amounts, timestamps)")]
    async fn format_value(&self, #[tool(aggr)] request: FormatValueRequest) -> String {
        to_json(&format::format_result(&request.key, &request.value))
    }
}

#[tool(tool_box)]
impl ServerHandler for ContractExplorerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("Explore smart contracts without a verified ABI: discover functions from bytecode, group them into read and write operations, call them through the analysis service and inspect state changes and call history.".into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
