//! Merges ABI items from the various discovery sources into one canonical,
//! callable function list.

use alloy::json_abi::{Function as AbiFunction, Param as AbiParam, StateMutability as AbiMutability};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::service::AbiVerifyResponse;
use super::{AbiSourceTag, FunctionDescriptor, ItemType, Param, StateMutability};

/// Outcome of the optional verification step.
#[derive(Debug, Clone)]
pub enum Verification {
    NotAttempted,
    Completed(AbiVerifyResponse),
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledAbi {
    pub functions: Vec<FunctionDescriptor>,
    pub events: Vec<FunctionDescriptor>,
    pub constructors: Vec<FunctionDescriptor>,
    pub source: AbiSourceTag,
    pub verification_attempted: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ReconciledAbi {
    pub fn verified_count(&self) -> usize {
        self.functions
            .iter()
            .filter(|f| f.verified == Some(true))
            .count()
    }
}

/// Fills a missing `stateMutability` from the legacy `constant` flag.
pub fn backfill_mutability(function: &mut FunctionDescriptor) {
    if function.state_mutability.is_none() {
        function.state_mutability = Some(if function.constant == Some(true) {
            StateMutability::View
        } else {
            StateMutability::Nonpayable
        });
    }
}

fn normalize(mut function: FunctionDescriptor) -> FunctionDescriptor {
    backfill_mutability(&mut function);
    if function.human_readable_signature.is_none() {
        function.human_readable_signature = Some(function.derive_human_readable());
    }
    function
}

/// Appends `discovered` to `existing`, skipping signatures already present.
pub fn merge_discovered(
    existing: &[FunctionDescriptor],
    discovered: Vec<FunctionDescriptor>,
) -> Vec<FunctionDescriptor> {
    let mut seen: HashSet<String> = existing.iter().map(FunctionDescriptor::signature).collect();
    let mut merged = existing.to_vec();

    for function in discovered.into_iter().filter(FunctionDescriptor::is_callable) {
        if seen.insert(function.signature()) {
            merged.push(normalize(function));
        } else {
            debug!("Skipping duplicate function {}", function.signature());
        }
    }
    merged
}

fn mark_verified(functions: &mut [FunctionDescriptor], response: &AbiVerifyResponse) {
    let confirmed: HashSet<(String, Vec<String>)> = response
        .verified_functions
        .iter()
        .map(|f| (f.name.clone(), f.input_types()))
        .collect();

    for function in functions.iter_mut() {
        let key = (function.name.clone(), function.input_types());
        function.verified = Some(confirmed.contains(&key));
    }
}

/// Builds the canonical list from raw ABI items.
///
/// Never fails: verification problems become warnings and the unverified
/// list is returned as-is.
pub fn reconcile(
    items: Vec<FunctionDescriptor>,
    source: AbiSourceTag,
    verification: Verification,
) -> ReconciledAbi {
    let mut callable = Vec::new();
    let mut events = Vec::new();
    let mut constructors = Vec::new();

    for item in items {
        match item.kind {
            None | Some(ItemType::Function) => callable.push(item),
            Some(ItemType::Event) => events.push(item),
            Some(ItemType::Constructor) => constructors.push(item),
            Some(ItemType::Other) => debug!("Ignoring non-callable ABI item '{}'", item.name),
        }
    }

    let mut functions = merge_discovered(&[], callable);
    let mut warnings = Vec::new();

    let verification_attempted = match verification {
        Verification::NotAttempted => false,
        Verification::Completed(response) if response.verified_functions.is_empty() => {
            warn!("ABI verification returned no matching functions");
            warnings.push(
                "Verification found none of the discovered functions in the deployed bytecode"
                    .to_string(),
            );
            for function in functions.iter_mut() {
                function.verified = Some(false);
            }
            true
        }
        Verification::Completed(response) => {
            mark_verified(&mut functions, &response);
            true
        }
        Verification::Failed(reason) => {
            warn!("ABI verification failed: {}", reason);
            warnings.push(format!(
                "Could not verify functions against the deployed bytecode: {}",
                reason
            ));
            true
        }
    };

    ReconciledAbi {
        functions,
        events,
        constructors,
        source,
        verification_attempted,
        warnings,
    }
}

fn convert_param(param: &AbiParam) -> Param {
    Param {
        name: param.name.clone(),
        ty: param.ty.clone(),
        components: param.components.iter().map(convert_param).collect(),
    }
}

/// Parses human-readable signatures such as `transfer(address,uint256)`.
///
/// Mutability is taken from the text only when it is spelled out. Bare
/// signatures come back without one, and `merge_discovered` then back-fills
/// `nonpayable`, so a bare `totalSupply()` classifies as a write.
pub fn parse_signatures(signatures: &[String]) -> Vec<FunctionDescriptor> {
    signatures
        .iter()
        .filter_map(|raw| {
            let text = raw.trim();
            match AbiFunction::parse(text) {
                Ok(parsed) => {
                    let explicit = text
                        .split(|c: char| c.is_whitespace() || c == ')')
                        .any(|word| matches!(word, "view" | "pure" | "payable" | "nonpayable"));
                    let state_mutability = explicit.then(|| match parsed.state_mutability {
                        AbiMutability::View => StateMutability::View,
                        AbiMutability::Pure => StateMutability::Pure,
                        AbiMutability::Payable => StateMutability::Payable,
                        AbiMutability::NonPayable => StateMutability::Nonpayable,
                    });

                    Some(FunctionDescriptor {
                        name: parsed.name.clone(),
                        inputs: parsed.inputs.iter().map(convert_param).collect(),
                        outputs: parsed.outputs.iter().map(convert_param).collect(),
                        state_mutability,
                        human_readable_signature: Some(text.to_string()),
                        kind: Some(ItemType::Function),
                        ..Default::default()
                    })
                }
                Err(e) => {
                    debug!("Unparseable function signature '{}': {}", text, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_abi() -> Vec<FunctionDescriptor> {
        serde_json::from_value(json!([
            {"type": "function", "name": "balanceOf",
             "inputs": [{"name": "owner", "type": "address"}],
             "outputs": [{"name": "", "type": "uint256"}], "constant": true},
            {"name": "transfer",
             "inputs": [{"name": "to", "type": "address"}, {"name": "amount", "type": "uint256"}],
             "outputs": [{"name": "", "type": "bool"}]},
            {"type": "event", "name": "Transfer",
             "inputs": [{"name": "from", "type": "address", "indexed": true}]},
            {"type": "constructor", "inputs": []},
            {"type": "fallback", "stateMutability": "payable"}
        ]))
        .unwrap()
    }

    fn verify_response(functions: Vec<FunctionDescriptor>) -> AbiVerifyResponse {
        AbiVerifyResponse {
            total: functions.len(),
            verified: functions.len(),
            verified_functions: functions,
        }
    }

    #[test]
    fn test_filters_and_backfills() {
        let abi = reconcile(raw_abi(), AbiSourceTag::Bytecode, Verification::NotAttempted);

        assert_eq!(abi.functions.len(), 2);
        assert_eq!(abi.events.len(), 1);
        assert_eq!(abi.constructors.len(), 1);
        assert_eq!(abi.functions[0].state_mutability, Some(StateMutability::View));
        assert_eq!(abi.functions[1].state_mutability, Some(StateMutability::Nonpayable));
        assert!(abi.functions.iter().all(|f| f.state_mutability.is_some()));
        assert!(abi.functions.iter().all(|f| f.verified.is_none()));
        assert!(!abi.verification_attempted);
        assert_eq!(
            abi.functions[0].human_readable_signature.as_deref(),
            Some("balanceOf(address owner) view returns (uint256)")
        );
    }

    #[test]
    fn test_verified_requires_name_and_input_types() {
        let verified = vec![
            FunctionDescriptor::new("balanceOf").with_inputs(vec![Param::new("a", "address")]),
            // same name, different inputs: must not verify `transfer(address,uint256)`
            FunctionDescriptor::new("transfer").with_inputs(vec![Param::new("to", "address")]),
        ];
        let abi = reconcile(
            raw_abi(),
            AbiSourceTag::Bytecode,
            Verification::Completed(verify_response(verified)),
        );

        assert_eq!(abi.functions[0].verified, Some(true));
        assert_eq!(abi.functions[1].verified, Some(false));
        assert_eq!(abi.verified_count(), 1);
        assert!(abi.warnings.is_empty());
    }

    #[test]
    fn test_empty_verification_marks_unverified_with_warning() {
        let abi = reconcile(
            raw_abi(),
            AbiSourceTag::Transaction,
            Verification::Completed(AbiVerifyResponse::default()),
        );
        assert_eq!(abi.functions.len(), 2);
        assert!(abi.functions.iter().all(|f| f.verified == Some(false)));
        assert_eq!(abi.warnings.len(), 1);
    }

    #[test]
    fn test_failed_verification_keeps_functions() {
        let abi = reconcile(
            raw_abi(),
            AbiSourceTag::Explorer,
            Verification::Failed("timeout".into()),
        );
        assert_eq!(abi.functions.len(), 2);
        assert!(abi.verification_attempted);
        assert!(abi.warnings[0].contains("timeout"));
        assert_eq!(abi.source, AbiSourceTag::Explorer);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let verified = vec![FunctionDescriptor::new("balanceOf")
            .with_inputs(vec![Param::new("owner", "address")])];

        let first = reconcile(
            raw_abi(),
            AbiSourceTag::Verified,
            Verification::Completed(verify_response(verified.clone())),
        );
        let second = reconcile(
            first.functions.clone(),
            AbiSourceTag::Verified,
            Verification::Completed(verify_response(verified)),
        );
        assert_eq!(first.functions, second.functions);
    }

    #[test]
    fn test_merge_dedups_by_signature() {
        let existing = reconcile(raw_abi(), AbiSourceTag::Bytecode, Verification::NotAttempted);
        let discovered = vec![
            FunctionDescriptor::new("transfer").with_inputs(vec![
                Param::new("recipient", "address"),
                Param::new("value", "uint256"),
            ]),
            FunctionDescriptor::new("approve").with_inputs(vec![
                Param::new("spender", "address"),
                Param::new("value", "uint256"),
            ]),
        ];

        let merged = merge_discovered(&existing.functions, discovered.clone());
        let names: Vec<_> = merged.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["balanceOf", "transfer", "approve"]);

        let again = merge_discovered(&merged, discovered);
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn test_parse_signatures() {
        let parsed = parse_signatures(&[
            "transfer(address,uint256)".to_string(),
            "function balanceOf(address owner) view returns (uint256)".to_string(),
            "not a signature(".to_string(),
        ]);

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].signature(), "transfer(address,uint256)");
        assert_eq!(parsed[0].state_mutability, None);
        assert_eq!(parsed[1].state_mutability, Some(StateMutability::View));
        assert_eq!(parsed[1].outputs.len(), 1);
    }

    #[test]
    fn test_bare_signature_is_backfilled_as_write() {
        let merged = merge_discovered(&[], parse_signatures(&["totalSupply()".to_string()]));
        assert_eq!(merged[0].state_mutability, Some(StateMutability::Nonpayable));
        assert!(!crate::ethereum::classifier::is_read_only(&merged[0]));

        let merged = merge_discovered(
            &[],
            parse_signatures(&["totalSupply() view returns (uint256)".to_string()]),
        );
        assert!(crate::ethereum::classifier::is_read_only(&merged[0]));
    }
}
