pub mod abi;
pub mod classifier;
pub mod format;
pub mod grouper;
pub mod orchestrator;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod utils;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("Failed to discover ABI for {address}: {reason}. Try supplying the contract bytecode manually.")]
    Discovery { address: String, reason: String },
    #[error("Function '{0}' not found")]
    FunctionNotFound(String),
    #[error("No contract is open")]
    NoContract,
    #[error("No function selected")]
    NoFunctionSelected,
    #[error("Input '{0}' does not exist on the selected function")]
    UnknownInput(String),
    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// Declared mutability of an ABI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateMutability {
    View,
    Pure,
    Nonpayable,
    Payable,
}

impl StateMutability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Pure => "pure",
            Self::Nonpayable => "nonpayable",
            Self::Payable => "payable",
        }
    }
}

/// Kind of ABI item. Anything other than the three kinds we care about
/// (fallback, receive, error) collapses into `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Function,
    Event,
    Constructor,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Param>,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            components: Vec::new(),
        }
    }

    /// Canonical type string, expanding `tuple` into its component list.
    pub fn canonical_type(&self) -> String {
        match self.ty.strip_prefix("tuple") {
            Some(suffix) if !self.components.is_empty() => {
                let inner: Vec<String> = self.components.iter().map(Param::canonical_type).collect();
                format!("({}){}", inner.join(","), suffix)
            }
            _ => self.ty.clone(),
        }
    }
}

/// One function (or event/constructor) exposed by a contract ABI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<Param>,
    #[serde(default)]
    pub outputs: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_mutability: Option<StateMutability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_readable_signature: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ItemType>,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<Param>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Param>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_mutability(mut self, mutability: StateMutability) -> Self {
        self.state_mutability = Some(mutability);
        self
    }

    /// Functions are callable; an absent `type` implies a function.
    pub fn is_callable(&self) -> bool {
        matches!(self.kind, None | Some(ItemType::Function))
    }

    pub fn input_types(&self) -> Vec<String> {
        self.inputs.iter().map(Param::canonical_type).collect()
    }

    /// Selector-style signature, e.g. `transfer(address,uint256)`.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.input_types().join(","))
    }

    /// Display signature, e.g. `balanceOf(address owner) view returns (uint256)`.
    pub fn derive_human_readable(&self) -> String {
        let params = |params: &[Param]| -> String {
            params
                .iter()
                .map(|p| {
                    if p.name.is_empty() {
                        p.canonical_type()
                    } else {
                        format!("{} {}", p.canonical_type(), p.name)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut signature = format!("{}({})", self.name, params(&self.inputs));
        if let Some(mutability) = self.state_mutability {
            if mutability != StateMutability::Nonpayable {
                signature.push(' ');
                signature.push_str(mutability.as_str());
            }
        }
        if !self.outputs.is_empty() {
            signature.push_str(&format!(" returns ({})", params(&self.outputs)));
        }
        signature
    }
}

/// A parameter bound to the raw string the user typed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundInput {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub value: String,
}

impl BoundInput {
    pub fn new(name: impl Into<String>, ty: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            value: value.into(),
        }
    }
}

/// Fields that may carry the primary return value, in probe order.
const RETURN_VALUE_KEYS: [&str; 6] = [
    "value",
    "result",
    "returnValue",
    "output",
    "data",
    "returnData",
];

/// Result body returned by the invocation service.
///
/// The service is not consistent about where it puts things, so accessors
/// probe the known aliases in a fixed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallResult(pub Value);

impl CallResult {
    pub fn primary_value(&self) -> Option<&Value> {
        match &self.0 {
            Value::Object(map) => RETURN_VALUE_KEYS
                .iter()
                .filter_map(|key| map.get(*key))
                .find(|value| !value.is_null()),
            Value::Null => None,
            other => Some(other),
        }
    }

    pub fn transaction_hash(&self) -> Option<&str> {
        ["transactionHash", "txId"]
            .iter()
            .find_map(|key| self.0.get(*key).and_then(Value::as_str))
    }

    /// True when the body carries anything worth keeping in history.
    pub fn has_data(&self) -> bool {
        self.primary_value().is_some() || self.transaction_hash().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub function_name: String,
    pub params: Vec<BoundInput>,
    pub result: CallResult,
    pub timestamp: DateTime<Utc>,
}

/// Query key (e.g. `balanceOf(0xabc…)`) to returned value.
pub type StateSnapshot = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub before: Option<Value>,
    pub after: Option<Value>,
}

pub type StateDiff = BTreeMap<String, StateChange>;

/// Which discovery method produced a function list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbiSourceTag {
    Bytecode,
    ManualBytecode,
    Transaction,
    Explorer,
    Verified,
    Unknown,
}

impl AbiSourceTag {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "bytecode" => Self::Bytecode,
            "manual-bytecode" | "manual_bytecode" | "manualbytecode" => Self::ManualBytecode,
            "transaction" | "transactions" => Self::Transaction,
            "explorer" | "etherscan" => Self::Explorer,
            "verified" => Self::Verified,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bytecode => "bytecode",
            Self::ManualBytecode => "manual-bytecode",
            Self::Transaction => "transaction",
            Self::Explorer => "explorer",
            Self::Verified => "verified",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AbiSourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
