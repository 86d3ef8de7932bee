//! Client side of the contract analysis/invocation backend.
//!
//! The backend decompiles bytecode, verifies ABIs, estimates gas and
//! executes calls. We only speak its JSON-over-POST contract.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::{BoundInput, CallResult, FunctionDescriptor};
use crate::config::ServiceConfig;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("{error}")]
    Api {
        status: u16,
        error: String,
        suggestion: Option<String>,
        body: Value,
    },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn message(&self) -> String {
        match self {
            Self::Api {
                error, suggestion, ..
            } => match suggestion {
                Some(suggestion) => format!("{} ({})", error, suggestion),
                None => error.clone(),
            },
            other => other.to_string(),
        }
    }

    /// Partial result data carried by a failed call, if any.
    pub fn partial_result(&self) -> Option<CallResult> {
        match self {
            Self::Api { body, .. } => {
                let result = CallResult(body.clone());
                result.has_data().then_some(result)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiFetchRequest {
    pub contract_address: String,
    pub analysis_method: String,
    pub bypass_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytecode: Option<String>,
    /// Cache-defeat field for intermediaries that ignore `bypassCache`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiFetchResponse {
    #[serde(default)]
    pub abi: Vec<FunctionDescriptor>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub verified: Option<bool>,
    #[serde(default)]
    pub function_signatures: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiVerifyResponse {
    #[serde(default)]
    pub verified_functions: Vec<FunctionDescriptor>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub verified: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallParameter {
    #[serde(rename = "type")]
    pub ty: String,
    pub value: String,
}

impl From<&BoundInput> for CallParameter {
    fn from(input: &BoundInput) -> Self {
        Self {
            ty: input.ty.clone(),
            value: input.value.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub contract_address: String,
    pub function_name: String,
    pub parameters: Vec<CallParameter>,
    pub is_query: bool,
    pub abi: Vec<FunctionDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimateRequest {
    pub contract_address: String,
    pub function_name: String,
    pub parameters: Vec<CallParameter>,
    pub abi: Vec<FunctionDescriptor>,
}

#[async_trait]
pub trait ContractService: Send + Sync {
    async fn fetch_abi(&self, request: &AbiFetchRequest) -> Result<AbiFetchResponse, ServiceError>;

    async fn verify_abi(
        &self,
        contract_address: &str,
        abi: &[FunctionDescriptor],
    ) -> Result<AbiVerifyResponse, ServiceError>;

    async fn function_exists(
        &self,
        contract_address: &str,
        function_name: &str,
        input_types: &[String],
    ) -> Result<bool, ServiceError>;

    async fn call(&self, request: &CallRequest) -> Result<CallResult, ServiceError>;

    async fn estimate_gas(&self, request: &GasEstimateRequest) -> Result<u64, ServiceError>;
}

/// HTTP implementation of [`ContractService`].
#[derive(Debug, Clone)]
pub struct HttpContractService {
    client: Client,
    config: ServiceConfig,
}

impl HttpContractService {
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value, ServiceError> {
        let url = self.url(path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Decode(format!("{} returned non-JSON body: {}", url, e)))?;

        if !status.is_success() {
            let error = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} returned status {}", url, status));
            let suggestion = body
                .get("suggestion")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Err(ServiceError::Api {
                status: status.as_u16(),
                error,
                suggestion,
                body,
            });
        }

        Ok(body)
    }

    fn decode<T: serde::de::DeserializeOwned>(what: &str, body: Value) -> Result<T, ServiceError> {
        serde_json::from_value(body)
            .map_err(|e| ServiceError::Decode(format!("malformed {} response: {}", what, e)))
    }
}

#[async_trait]
impl ContractService for HttpContractService {
    async fn fetch_abi(&self, request: &AbiFetchRequest) -> Result<AbiFetchResponse, ServiceError> {
        let body = self.post(&self.config.endpoints.fetch_abi, request).await?;
        Self::decode("ABI fetch", body)
    }

    async fn verify_abi(
        &self,
        contract_address: &str,
        abi: &[FunctionDescriptor],
    ) -> Result<AbiVerifyResponse, ServiceError> {
        let request = serde_json::json!({
            "contractAddress": contract_address,
            "abi": abi,
        });
        let body = self.post(&self.config.endpoints.verify_abi, &request).await?;
        Self::decode("ABI verify", body)
    }

    async fn function_exists(
        &self,
        contract_address: &str,
        function_name: &str,
        input_types: &[String],
    ) -> Result<bool, ServiceError> {
        let request = serde_json::json!({
            "contractAddress": contract_address,
            "functionName": function_name,
            "inputTypes": input_types,
        });
        let body = self
            .post(&self.config.endpoints.function_exists, &request)
            .await?;
        body.get("exists")
            .and_then(Value::as_bool)
            .ok_or_else(|| ServiceError::Decode("existence check missing 'exists'".to_string()))
    }

    async fn call(&self, request: &CallRequest) -> Result<CallResult, ServiceError> {
        let body = self.post(&self.config.endpoints.call, request).await?;
        Ok(CallResult(body))
    }

    async fn estimate_gas(&self, request: &GasEstimateRequest) -> Result<u64, ServiceError> {
        let body = self.post(&self.config.endpoints.estimate_gas, request).await?;
        let estimate = body
            .get("gasEstimate")
            .ok_or_else(|| ServiceError::Decode("gas estimate missing 'gasEstimate'".to_string()))?;

        // Some backends send the estimate as a decimal string
        match estimate {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| ServiceError::Decode(format!("invalid gas estimate: {}", estimate)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_parameters_are_trimmed() {
        let input = BoundInput::new("to", "address", "  0xabc \n");
        let param = CallParameter::from(&input);
        assert_eq!(param.value, "0xabc");
        assert_eq!(
            serde_json::to_value(&param).unwrap(),
            json!({"type": "address", "value": "0xabc"})
        );
    }

    #[test]
    fn test_fetch_request_wire_shape() {
        let request = AbiFetchRequest {
            contract_address: "0x1".into(),
            analysis_method: "bytecode".into(),
            bypass_cache: true,
            bytecode: None,
            timestamp: Some(5),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "contractAddress": "0x1",
                "analysisMethod": "bytecode",
                "bypassCache": true,
                "timestamp": 5
            })
        );
    }

    #[test]
    fn test_fetch_response_tolerates_missing_fields() {
        let response: AbiFetchResponse = serde_json::from_value(json!({
            "abi": [{"name": "owner", "outputs": [{"type": "address"}]}],
            "functionSignatures": ["transfer(address,uint256)"]
        }))
        .unwrap();
        assert_eq!(response.abi.len(), 1);
        assert_eq!(response.function_signatures.len(), 1);
        assert!(response.source.is_none());
    }

    #[test]
    fn test_partial_result_from_api_error() {
        let error = ServiceError::Api {
            status: 400,
            error: "execution reverted".into(),
            suggestion: Some("check the index".into()),
            body: json!({"error": "execution reverted", "returnData": "0x08c379a0"}),
        };
        assert_eq!(error.message(), "execution reverted (check the index)");
        let partial = error.partial_result().unwrap();
        assert_eq!(partial.primary_value(), Some(&json!("0x08c379a0")));

        let bare = ServiceError::Api {
            status: 500,
            error: "boom".into(),
            suggestion: None,
            body: json!({"error": "boom"}),
        };
        assert!(bare.partial_result().is_none());
    }

    #[test]
    fn test_service_url_joining() {
        let mut config = ServiceConfig::default();
        config.base_url = "http://localhost:3000/api/".into();
        let service = HttpContractService::new(config).unwrap();
        assert_eq!(service.url("/call-contract"), "http://localhost:3000/api/call-contract");
    }
}
