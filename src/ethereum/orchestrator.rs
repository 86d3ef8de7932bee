//! Drives a single function invocation:
//!
//! `Idle → Verifying → (PreSnapshot) → Calling → (PostSnapshot) → Completed | Failed`
//!
//! with one extra edge, `Calling --misclassified--> RetryingAsWrite → Calling`,
//! taken at most once per submission and only from a read attempt.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::classifier;
use super::service::{CallParameter, CallRequest, ContractService, GasEstimateRequest};
use super::session::{Session, SessionTicket};
use super::utils::{self, is_misclassification_error};
use super::{
    BoundInput, CallResult, ExplorerError, FunctionDescriptor, HistoryEntry, Param, StateChange,
    StateDiff, StateMutability, StateSnapshot,
};
use crate::config::OrchestratorConfig;

/// Functions whose effect on balances/allowances is worth snapshotting.
pub const STATE_AFFECTING: [&str; 6] = [
    "transfer",
    "transferFrom",
    "approve",
    "mint",
    "burn",
    "setApprovalForAll",
];

pub const MUTABILITY_CORRECTED: &str = "ABI mutability was incorrect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallState {
    Idle,
    Verifying,
    PreSnapshot,
    Calling,
    RetryingAsWrite,
    PostSnapshot,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum VerificationStatus {
    Confirmed,
    NotFound,
    Unavailable(String),
    Skipped,
}

impl VerificationStatus {
    /// Whether verification cast doubt on the function's existence.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, Self::NotFound | Self::Unavailable(_))
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub settle_delay: Duration,
    pub capture_state_diff: bool,
    pub verify_before_call: bool,
    pub estimate_gas_before_write: bool,
    pub allow_writes: bool,
}

impl OrchestratorOptions {
    pub fn from_config(config: &OrchestratorConfig, allow_writes: bool) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            capture_state_diff: config.capture_state_diff,
            verify_before_call: config.verify_before_call,
            estimate_gas_before_write: config.estimate_gas_before_write,
            allow_writes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub function_name: String,
    pub signature: String,
    pub params: Vec<BoundInput>,
    pub as_write: bool,
    pub state: CallState,
    pub transitions: Vec<CallState>,
    pub verification: VerificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CallResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub retried_as_write: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_estimate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_before: Option<StateSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_after: Option<StateSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_diff: Option<StateDiff>,
}

impl CallOutcome {
    fn new(function: &FunctionDescriptor, params: &[BoundInput]) -> Self {
        Self {
            function_name: function.name.clone(),
            signature: function.signature(),
            params: params.to_vec(),
            as_write: false,
            state: CallState::Idle,
            transitions: vec![CallState::Idle],
            verification: VerificationStatus::Skipped,
            result: None,
            error: None,
            warnings: Vec::new(),
            note: None,
            retried_as_write: false,
            gas_estimate: None,
            state_before: None,
            state_after: None,
            state_diff: None,
        }
    }

    fn advance(&mut self, next: CallState) {
        debug!("{}: {:?} -> {:?}", self.signature, self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    pub fn succeeded(&self) -> bool {
        self.state == CallState::Completed
    }

    /// History entry for any outcome that carried a result.
    pub fn history_entry(&self) -> Option<HistoryEntry> {
        let result = self.result.clone()?;
        Some(HistoryEntry {
            function_name: self.function_name.clone(),
            params: self.params.clone(),
            result,
            timestamp: Utc::now(),
        })
    }
}

/// The single-retry rule, kept separate so it can be checked on its own.
pub fn should_retry_as_write(
    attempted_as_write: bool,
    already_retried: bool,
    verification: &VerificationStatus,
    error: &str,
) -> bool {
    !attempted_as_write
        && !already_retried
        && verification.is_uncertain()
        && is_misclassification_error(error)
}

/// A read-only query issued around a write to capture state.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub key: String,
    pub function: FunctionDescriptor,
    pub params: Vec<CallParameter>,
}

fn probe_function(name: &str, inputs: Vec<Param>) -> FunctionDescriptor {
    FunctionDescriptor::new(name)
        .with_inputs(inputs)
        .with_outputs(vec![Param::new("", "uint256")])
        .with_mutability(StateMutability::View)
}

fn address_param(value: &str) -> CallParameter {
    CallParameter {
        ty: "address".to_string(),
        value: value.to_string(),
    }
}

/// Probe queries for a state-affecting call, or nothing when the call is
/// not state-affecting or binds no usable address.
pub fn build_probes(function_name: &str, inputs: &[BoundInput]) -> Vec<Probe> {
    if !STATE_AFFECTING.contains(&function_name) {
        return Vec::new();
    }

    let mut addresses: Vec<String> = Vec::new();
    for input in inputs.iter().filter(|i| i.ty == "address") {
        let value = input.value.trim();
        if utils::validate_address(value).is_ok()
            && !addresses.iter().any(|a| a.eq_ignore_ascii_case(value))
        {
            addresses.push(value.to_string());
        }
    }
    if addresses.is_empty() {
        return Vec::new();
    }

    let mut probes: Vec<Probe> = addresses
        .iter()
        .map(|address| Probe {
            key: format!("balanceOf({})", address),
            function: probe_function("balanceOf", vec![Param::new("account", "address")]),
            params: vec![address_param(address)],
        })
        .collect();

    if let [owner, spender, ..] = addresses.as_slice() {
        probes.push(Probe {
            key: format!("allowance({},{})", owner, spender),
            function: probe_function(
                "allowance",
                vec![Param::new("owner", "address"), Param::new("spender", "address")],
            ),
            params: vec![address_param(owner), address_param(spender)],
        });
    }

    probes.push(Probe {
        key: "totalSupply()".to_string(),
        function: probe_function("totalSupply", Vec::new()),
        params: Vec::new(),
    });
    probes
}

/// Keys whose value differs between the two snapshots; `None` when nothing changed.
pub fn diff_snapshots(before: &StateSnapshot, after: &StateSnapshot) -> Option<StateDiff> {
    let mut diff = StateDiff::new();
    for key in before.keys().chain(after.keys()) {
        if diff.contains_key(key) {
            continue;
        }
        let (old, new) = (before.get(key), after.get(key));
        if old != new {
            diff.insert(
                key.clone(),
                StateChange {
                    before: old.cloned(),
                    after: new.cloned(),
                },
            );
        }
    }
    (!diff.is_empty()).then_some(diff)
}

/// Everything one invocation needs, copied out of the session.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    ticket: SessionTicket,
    contract_address: String,
    abi: Arc<Vec<FunctionDescriptor>>,
    function: FunctionDescriptor,
    inputs: Vec<BoundInput>,
    verify: bool,
}

impl PreparedCall {
    /// The selected function with its bound inputs.
    pub fn selected(session: &Session) -> Result<Self, ExplorerError> {
        let function = session
            .selected()
            .cloned()
            .ok_or(ExplorerError::NoFunctionSelected)?;
        Ok(Self {
            ticket: session.ticket(),
            contract_address: session.contract_address().to_string(),
            abi: session.functions(),
            function,
            inputs: session.inputs().to_vec(),
            verify: true,
        })
    }

    /// A history entry's parameters against the current function of that name.
    pub fn replay(session: &Session, index: usize) -> Result<Self, ExplorerError> {
        let entry = session
            .history()
            .get(index)
            .ok_or_else(|| ExplorerError::Invalid(format!("No history entry at index {}", index)))?;
        let function = session
            .find_function(&entry.function_name)
            .cloned()
            .ok_or_else(|| ExplorerError::FunctionNotFound(entry.function_name.clone()))?;

        info!("Replaying {} from history", function.signature());
        Ok(Self {
            ticket: session.ticket(),
            contract_address: session.contract_address().to_string(),
            abi: session.functions(),
            function,
            inputs: entry.params.clone(),
            verify: false,
        })
    }

    /// Adds the outcome to history if it carried a result and the session
    /// is still the one the call started from.
    pub fn record(&self, session: &mut Session, outcome: &CallOutcome) -> bool {
        match outcome.history_entry() {
            Some(entry) => session.record_if_current(&self.ticket, entry),
            None => false,
        }
    }
}

pub struct CallOrchestrator {
    service: Arc<dyn ContractService>,
    options: OrchestratorOptions,
}

impl CallOrchestrator {
    pub fn new(service: Arc<dyn ContractService>, options: OrchestratorOptions) -> Self {
        Self { service, options }
    }

    /// Calls the session's selected function with its bound inputs and
    /// records the outcome.
    pub async fn submit(&self, session: &mut Session) -> Result<CallOutcome, ExplorerError> {
        let call = PreparedCall::selected(session)?;
        let outcome = self.execute(&call).await;
        call.record(session, &outcome);
        Ok(outcome)
    }

    /// Re-runs a history entry against the current function of the same
    /// name. Verification is not repeated.
    pub async fn replay(&self, session: &mut Session, index: usize) -> Result<CallOutcome, ExplorerError> {
        let call = PreparedCall::replay(session, index)?;
        let outcome = self.execute(&call).await;
        call.record(session, &outcome);
        Ok(outcome)
    }

    /// Runs a prepared call. Needs no access to the session, so callers can
    /// release it for the duration.
    pub async fn execute(&self, call: &PreparedCall) -> CallOutcome {
        self.run(&call.contract_address, &call.abi, &call.function, &call.inputs, call.verify)
            .await
    }

    /// Runs one invocation without touching any session state.
    pub async fn invoke(
        &self,
        contract_address: &str,
        abi: &[FunctionDescriptor],
        function: &FunctionDescriptor,
        inputs: &[BoundInput],
    ) -> CallOutcome {
        self.run(contract_address, abi, function, inputs, self.options.verify_before_call)
            .await
    }

    async fn run(
        &self,
        contract_address: &str,
        abi: &[FunctionDescriptor],
        function: &FunctionDescriptor,
        inputs: &[BoundInput],
        verify: bool,
    ) -> CallOutcome {
        let mut outcome = CallOutcome::new(function, inputs);

        if !function.is_callable() {
            outcome.error = Some(format!("'{}' is not a callable function", function.name));
            outcome.advance(CallState::Failed);
            return outcome;
        }

        if verify && self.options.verify_before_call {
            outcome.advance(CallState::Verifying);
            outcome.verification = self.verify(contract_address, function).await;
            match &outcome.verification {
                VerificationStatus::NotFound => outcome.warnings.push(format!(
                    "'{}' was not found in the deployed bytecode; calling anyway",
                    function.signature()
                )),
                VerificationStatus::Unavailable(reason) => outcome
                    .warnings
                    .push(format!("Could not verify '{}': {}", function.signature(), reason)),
                _ => {}
            }
        }

        let parameters: Vec<CallParameter> = inputs.iter().map(CallParameter::from).collect();
        let mut as_write = !classifier::is_read_only(function);

        loop {
            outcome.as_write = as_write;

            if as_write {
                if !self.options.allow_writes {
                    outcome.error = Some(format!(
                        "'{}' modifies state and write operations are disabled",
                        function.name
                    ));
                    outcome.advance(CallState::Failed);
                    return outcome;
                }

                if self.options.estimate_gas_before_write
                    && !outcome.retried_as_write
                    && outcome.gas_estimate.is_none()
                {
                    self.estimate_gas(contract_address, abi, function, &parameters, &mut outcome)
                        .await;
                }

                if self.options.capture_state_diff && outcome.state_before.is_none() {
                    let probes = build_probes(&function.name, inputs);
                    if !probes.is_empty() {
                        outcome.advance(CallState::PreSnapshot);
                        outcome.state_before = self.capture(contract_address, &probes).await;
                    }
                }
            }

            outcome.advance(CallState::Calling);
            let request = CallRequest {
                contract_address: contract_address.to_string(),
                function_name: function.name.clone(),
                parameters: parameters.clone(),
                is_query: !as_write,
                abi: abi.to_vec(),
            };

            match self.service.call(&request).await {
                Ok(result) => {
                    outcome.result = Some(result);
                    if outcome.retried_as_write {
                        outcome.note = Some(MUTABILITY_CORRECTED.to_string());
                    }
                    break;
                }
                Err(e) => {
                    let message = e.message();
                    if should_retry_as_write(
                        as_write,
                        outcome.retried_as_write,
                        &outcome.verification,
                        &message,
                    ) {
                        if self.options.allow_writes {
                            warn!(
                                "Read call to {} failed ({}), retrying as a transaction",
                                function.signature(),
                                message
                            );
                            outcome.advance(CallState::RetryingAsWrite);
                            outcome.retried_as_write = true;
                            as_write = true;
                            continue;
                        }
                        outcome.warnings.push(
                            "The function looks state-changing but write operations are disabled"
                                .to_string(),
                        );
                    }

                    outcome.error = Some(utils::interpret_call_error(&message));
                    outcome.result = e.partial_result();
                    outcome.advance(CallState::Failed);
                    return outcome;
                }
            }
        }

        if as_write {
            if let Some(before) = outcome.state_before.clone() {
                outcome.advance(CallState::PostSnapshot);
                tokio::time::sleep(self.options.settle_delay).await;
                let probes = build_probes(&function.name, inputs);
                outcome.state_after = self.capture(contract_address, &probes).await;
                if let Some(after) = &outcome.state_after {
                    outcome.state_diff = diff_snapshots(&before, after);
                }
            }
        }

        outcome.advance(CallState::Completed);
        outcome
    }

    async fn verify(&self, contract_address: &str, function: &FunctionDescriptor) -> VerificationStatus {
        match self
            .service
            .function_exists(contract_address, &function.name, &function.input_types())
            .await
        {
            Ok(true) => VerificationStatus::Confirmed,
            Ok(false) => {
                warn!("{} not found in deployed bytecode", function.signature());
                VerificationStatus::NotFound
            }
            Err(e) => {
                warn!("Verification of {} failed: {}", function.signature(), e);
                VerificationStatus::Unavailable(e.message())
            }
        }
    }

    async fn estimate_gas(
        &self,
        contract_address: &str,
        abi: &[FunctionDescriptor],
        function: &FunctionDescriptor,
        parameters: &[CallParameter],
        outcome: &mut CallOutcome,
    ) {
        let request = GasEstimateRequest {
            contract_address: contract_address.to_string(),
            function_name: function.name.clone(),
            parameters: parameters.to_vec(),
            abi: abi.to_vec(),
        };
        match self.service.estimate_gas(&request).await {
            Ok(gas) => outcome.gas_estimate = Some(gas),
            Err(e) => {
                warn!("Gas estimation for {} failed: {}", function.signature(), e);
                outcome
                    .warnings
                    .push(format!("Gas estimation failed: {}", e.message()));
            }
        }
    }

    /// Issues probes one at a time. Failed probes are skipped; a snapshot
    /// with nothing in it is `None`.
    async fn capture(&self, contract_address: &str, probes: &[Probe]) -> Option<StateSnapshot> {
        let mut snapshot = StateSnapshot::new();
        for probe in probes {
            let request = CallRequest {
                contract_address: contract_address.to_string(),
                function_name: probe.function.name.clone(),
                parameters: probe.params.clone(),
                is_query: true,
                abi: vec![probe.function.clone()],
            };
            match self.service.call(&request).await {
                Ok(result) => {
                    let value = result.primary_value().cloned().unwrap_or(result.0);
                    snapshot.insert(probe.key.clone(), value);
                }
                Err(e) => debug!("State probe {} failed: {}", probe.key, e),
            }
        }
        (!snapshot.is_empty()).then_some(snapshot)
    }
}
