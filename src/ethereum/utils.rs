use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use std::str::FromStr;

/// Validates and normalizes an Ethereum address
pub fn validate_address(address: &str) -> Result<Address> {
    let address = address.trim();

    if address.is_empty() {
        return Err(anyhow!("Address cannot be empty"));
    }

    if !address.starts_with("0x") && !address.starts_with("0X") {
        return Err(anyhow!(
            "Invalid address format: '{}'. Ethereum addresses must start with '0x'",
            address
        ));
    }

    if address.len() != 42 {
        return Err(anyhow!(
            "Invalid address length: '{}'. Ethereum addresses must be exactly 42 characters (0x + 40 hex characters)",
            address
        ));
    }

    let hex_part = &address[2..];
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "Invalid address format: '{}'. Contains non-hexadecimal characters",
            address
        ));
    }

    Address::from_str(address)
        .map_err(|e| anyhow!("Invalid Ethereum address: '{}'. Error: {}", address, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertKind {
    OutOfBounds,
    PermissionDenied,
    Other,
}

/// Coarse classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    Revert(RevertKind),
    /// The function was called as a query but actually mutates state.
    Misclassified,
    Network,
    Other,
}

/// Error text that means "this is not really a view function".
pub fn is_misclassification_error(error: &str) -> bool {
    let error = error.to_ascii_lowercase();
    error.contains("view function") || error.contains("cannot estimate gas")
}

pub fn classify_call_error(error: &str) -> CallErrorKind {
    let lower = error.to_ascii_lowercase();

    if is_misclassification_error(&lower) {
        CallErrorKind::Misclassified
    } else if lower.contains("revert") || lower.contains("call exception") {
        let kind = if ["out of bounds", "out-of-bounds", "invalid index", "index out", "array index"]
            .iter()
            .any(|n| lower.contains(n))
        {
            RevertKind::OutOfBounds
        } else if ["not owner", "only owner", "ownable", "unauthorized", "access denied", "permission", "accesscontrol", "caller is not"]
            .iter()
            .any(|n| lower.contains(n))
        {
            RevertKind::PermissionDenied
        } else {
            RevertKind::Other
        };
        CallErrorKind::Revert(kind)
    } else if ["connection refused", "network unreachable", "timeout", "timed out", "request failed", "rate limit"]
        .iter()
        .any(|n| lower.contains(n))
    {
        CallErrorKind::Network
    } else {
        CallErrorKind::Other
    }
}

/// Creates user-friendly error messages for failed contract calls
pub fn interpret_call_error(error: &str) -> String {
    match classify_call_error(error) {
        CallErrorKind::Revert(RevertKind::OutOfBounds) => format!(
            "Contract reverted: an index or array position was out of bounds. Check numeric index parameters. ({})",
            error
        ),
        CallErrorKind::Revert(RevertKind::PermissionDenied) => format!(
            "Contract reverted: the caller is not permitted to call this function. It is probably restricted to the owner or a role holder. ({})",
            error
        ),
        CallErrorKind::Revert(RevertKind::Other) => format!(
            "Contract reverted: the function's requirements were not met or an assertion failed. ({})",
            error
        ),
        CallErrorKind::Misclassified => format!(
            "The function appears to modify state and cannot be called as a read-only query. ({})",
            error
        ),
        CallErrorKind::Network => format!(
            "Network error: the analysis service could not be reached or timed out. ({})",
            error
        ),
        CallErrorKind::Other => format!("Call failed: {}", error),
    }
}

/// Creates user-friendly error messages for ABI discovery errors
pub fn interpret_discovery_error(error: &str, contract_address: &str) -> String {
    let lower = error.to_ascii_lowercase();
    if lower.contains("404") || lower.contains("not found") || lower.contains("no bytecode") {
        format!(
            "No contract code found at {}. Check the address, or supply the bytecode manually.",
            contract_address
        )
    } else if lower.contains("rate limit") || lower.contains("429") {
        "Rate limit: too many requests to the analysis service. Try again in a few moments.".to_string()
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "Timeout: bytecode analysis took too long. Try again, or supply the bytecode manually.".to_string()
    } else {
        format!("ABI discovery error: {}", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("0x742d35Cc6435C9c1c72c5E7b18BaB7e1DB7a5d6e").is_ok());
        assert!(validate_address(" 0x0000000000000000000000000000000000000000 ").is_ok());

        assert!(validate_address("").is_err());
        assert!(validate_address("not_an_address").is_err());
        assert!(validate_address("0x123").is_err());
        assert!(validate_address("742d35Cc6435C9c1c72c5E7b18BaB7e1DB7a5d6e").is_err());
        assert!(validate_address("0xgg2d35Cc6435C9c1c72c5E7b18BaB7e1DB7a5d6e").is_err());
    }

    #[test]
    fn test_classify_call_error() {
        assert_eq!(
            classify_call_error("Cannot estimate gas; transaction may fail"),
            CallErrorKind::Misclassified
        );
        assert_eq!(
            classify_call_error("not a view function"),
            CallErrorKind::Misclassified
        );
        assert_eq!(
            classify_call_error("execution reverted: index out of bounds"),
            CallErrorKind::Revert(RevertKind::OutOfBounds)
        );
        assert_eq!(
            classify_call_error("execution reverted: Ownable: caller is not the owner"),
            CallErrorKind::Revert(RevertKind::PermissionDenied)
        );
        assert_eq!(
            classify_call_error("execution reverted"),
            CallErrorKind::Revert(RevertKind::Other)
        );
        assert_eq!(
            classify_call_error("request failed: connection refused"),
            CallErrorKind::Network
        );
        assert_eq!(classify_call_error("weird"), CallErrorKind::Other);
    }

    #[test]
    fn test_interpret_call_error_keeps_original_text() {
        let message = interpret_call_error("execution reverted: invalid index");
        assert!(message.contains("out of bounds"));
        assert!(message.contains("invalid index"));
    }
}
