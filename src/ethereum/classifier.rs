//! Read-only vs. state-mutating classification of ABI functions.
//!
//! Classification is an ordered chain of rules; the first rule whose
//! predicate matches decides. Explicit mutability comes first, name
//! heuristics last. When nothing matches the function is treated as a
//! write: calling a mutating function as a query fails loudly and the
//! orchestrator can recover, the reverse silently drops a transaction.

use super::{FunctionDescriptor, StateMutability};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Read,
    Write,
}

/// A single link in the classification chain.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub matches: fn(&FunctionDescriptor) -> bool,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    /// Name of the rule that decided, or `"default"`.
    pub rule: &'static str,
}

const READ_PREFIXES: &[&str] = &[
    "get", "view", "is", "has", "check", "calculate", "compute", "find", "total", "balance",
    "supply", "read", "retrieve",
];
const READ_EXACT: &[&str] = &[
    "name",
    "symbol",
    "decimals",
    "totalsupply",
    "balanceof",
    "allowance",
    "owner",
    "paused",
    "version",
];

const WRITE_PREFIXES: &[&str] = &[
    "set", "add", "remove", "delete", "update", "create", "mint", "burn", "transfer", "approve",
    "store", "write", "save", "put",
];
const WRITE_EXACT: &[&str] = &[
    "deposit", "withdraw", "claim", "stake", "unstake", "swap", "execute",
];
const WRITE_SUBSTRINGS: &[&str] = &["transfer", "update", "create", "delete", "remove", "store", "save"];

pub const RULES: &[Rule] = &[
    Rule {
        name: "explicit-read",
        matches: |f| {
            matches!(
                f.state_mutability,
                Some(StateMutability::View | StateMutability::Pure)
            )
        },
        verdict: Verdict::Read,
    },
    Rule {
        name: "explicit-write",
        matches: |f| {
            matches!(
                f.state_mutability,
                Some(StateMutability::Payable | StateMutability::Nonpayable)
            )
        },
        verdict: Verdict::Write,
    },
    Rule {
        name: "legacy-constant",
        matches: |f| f.constant == Some(true),
        verdict: Verdict::Read,
    },
    Rule {
        name: "getter-shape",
        matches: |f| f.inputs.is_empty() && !f.outputs.is_empty(),
        verdict: Verdict::Read,
    },
    Rule {
        name: "write-name",
        matches: |f| matches_write_name(&f.name),
        verdict: Verdict::Write,
    },
    Rule {
        name: "read-name",
        matches: |f| matches_read_name(&f.name),
        verdict: Verdict::Read,
    },
    Rule {
        name: "has-outputs",
        matches: |f| !f.outputs.is_empty(),
        verdict: Verdict::Read,
    },
];

pub fn matches_write_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    if name.is_empty() {
        return false;
    }
    WRITE_PREFIXES.iter().any(|p| name.starts_with(p))
        || WRITE_EXACT.contains(&name.as_str())
        || WRITE_SUBSTRINGS.iter().any(|s| name.contains(s))
}

pub fn matches_read_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    if name.is_empty() {
        return false;
    }
    READ_PREFIXES.iter().any(|p| name.starts_with(p)) || READ_EXACT.contains(&name.as_str())
}

pub fn classify(function: &FunctionDescriptor) -> Classification {
    classify_with(RULES, function)
}

/// Runs an arbitrary rule chain. Events and constructors are never read-only.
pub fn classify_with(rules: &[Rule], function: &FunctionDescriptor) -> Classification {
    if !function.is_callable() {
        return Classification {
            verdict: Verdict::Write,
            rule: "not-callable",
        };
    }

    rules
        .iter()
        .find(|rule| (rule.matches)(function))
        .map(|rule| Classification {
            verdict: rule.verdict,
            rule: rule.name,
        })
        .unwrap_or(Classification {
            verdict: Verdict::Write,
            rule: "default",
        })
}

pub fn is_read_only(function: &FunctionDescriptor) -> bool {
    classify(function).verdict == Verdict::Read
}

/// Splits a function list into (read, write), preserving order.
pub fn partition(functions: &[FunctionDescriptor]) -> (Vec<FunctionDescriptor>, Vec<FunctionDescriptor>) {
    functions
        .iter()
        .filter(|f| f.is_callable())
        .cloned()
        .partition(is_read_only)
}
