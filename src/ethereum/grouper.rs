//! Buckets read and write functions into display categories.

use serde::Serialize;
use std::collections::BTreeMap;

use super::{classifier, FunctionDescriptor};

/// Display categories. Variant order is display order within each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Category {
    Metadata,
    StateAndBalances,
    Permissions,
    Configuration,
    OtherRead,
    TokenOperations,
    AdminFunctions,
    Ownership,
    OtherWrite,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Metadata => "Metadata",
            Self::StateAndBalances => "State & Balances",
            Self::Permissions => "Permissions",
            Self::Configuration => "Configuration",
            Self::OtherRead => "Other Read Functions",
            Self::TokenOperations => "Token Operations",
            Self::AdminFunctions => "Admin Functions",
            Self::Ownership => "Ownership",
            Self::OtherWrite => "Other Write Functions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Read,
    Write,
}

pub type Groups = BTreeMap<Category, Vec<FunctionDescriptor>>;

#[derive(Debug, Clone, Default)]
pub struct GroupedFunctions {
    pub read: Groups,
    pub write: Groups,
}

fn contains_any(name: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| name.contains(n))
}

fn read_category(name: &str) -> Category {
    let lower = name.to_ascii_lowercase();
    if ["name", "symbol", "decimals", "totalSupply", "version"].contains(&name) {
        Category::Metadata
    } else if contains_any(&lower, &["balance", "total", "count"]) || lower.starts_with("get") {
        Category::StateAndBalances
    } else if contains_any(&lower, &["allowance", "allowed", "owner", "hasrole", "permission"]) {
        Category::Permissions
    } else if contains_any(&lower, &["fee", "rate", "config", "param", "settings"]) {
        Category::Configuration
    } else {
        Category::OtherRead
    }
}

fn write_category(name: &str) -> Category {
    let lower = name.to_ascii_lowercase();
    if ["transfer", "mint", "burn", "approve", "transferFrom"].contains(&name) {
        Category::TokenOperations
    } else if lower.starts_with("set") || contains_any(&lower, &["admin", "config", "update"]) {
        Category::AdminFunctions
    } else if contains_any(&lower, &["owner", "role", "grant", "revoke"]) {
        Category::Ownership
    } else {
        Category::OtherWrite
    }
}

pub fn category_for(side: Side, name: &str) -> Category {
    match side {
        Side::Read => read_category(name),
        Side::Write => write_category(name),
    }
}

/// Stable partition of one side's functions. Empty categories never appear.
pub fn group_by_category(side: Side, functions: &[FunctionDescriptor]) -> Groups {
    let mut groups = Groups::new();
    for function in functions {
        groups
            .entry(category_for(side, &function.name))
            .or_default()
            .push(function.clone());
    }
    groups
}

/// Classifies, then groups each side separately.
pub fn group_functions(functions: &[FunctionDescriptor]) -> GroupedFunctions {
    let (read, write) = classifier::partition(functions);
    GroupedFunctions {
        read: group_by_category(Side::Read, &read),
        write: group_by_category(Side::Write, &write),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethereum::StateMutability;

    fn view(name: &str) -> FunctionDescriptor {
        FunctionDescriptor::new(name).with_mutability(StateMutability::View)
    }

    fn write(name: &str) -> FunctionDescriptor {
        FunctionDescriptor::new(name).with_mutability(StateMutability::Nonpayable)
    }

    #[test]
    fn test_read_categories() {
        assert_eq!(category_for(Side::Read, "symbol"), Category::Metadata);
        assert_eq!(category_for(Side::Read, "totalSupply"), Category::Metadata);
        assert_eq!(category_for(Side::Read, "balanceOf"), Category::StateAndBalances);
        assert_eq!(category_for(Side::Read, "getReserves"), Category::StateAndBalances);
        assert_eq!(category_for(Side::Read, "allowance"), Category::Permissions);
        assert_eq!(category_for(Side::Read, "hasRole"), Category::Permissions);
        assert_eq!(category_for(Side::Read, "protocolFee"), Category::Configuration);
        assert_eq!(category_for(Side::Read, "paused"), Category::OtherRead);
    }

    #[test]
    fn test_read_priority_first_match_wins() {
        // "getOwner" starts with "get" before the permissions check sees "owner"
        assert_eq!(category_for(Side::Read, "getOwner"), Category::StateAndBalances);
    }

    #[test]
    fn test_write_categories() {
        assert_eq!(category_for(Side::Write, "transferFrom"), Category::TokenOperations);
        assert_eq!(category_for(Side::Write, "setFee"), Category::AdminFunctions);
        assert_eq!(category_for(Side::Write, "updateConfig"), Category::AdminFunctions);
        assert_eq!(category_for(Side::Write, "grantRole"), Category::Ownership);
        assert_eq!(category_for(Side::Write, "transferOwnership"), Category::Ownership);
        assert_eq!(category_for(Side::Write, "deposit"), Category::OtherWrite);
    }

    #[test]
    fn test_grouping_is_a_partition() {
        let functions = vec![
            view("name"),
            view("balanceOf"),
            view("owner"),
            view("feeRate"),
            view("paused"),
            view("getPrice"),
            write("transfer"),
            write("setFee"),
            write("renounceOwnership"),
            write("deposit"),
            write("mint"),
        ];

        let grouped = group_functions(&functions);
        let mut seen: Vec<String> = grouped
            .read
            .values()
            .chain(grouped.write.values())
            .flatten()
            .map(|f| f.name.clone())
            .collect();
        seen.sort();

        let mut expected: Vec<String> = functions.iter().map(|f| f.name.clone()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_order_within_category_is_input_order() {
        let functions = vec![view("totalStaked"), view("balanceOf"), view("getPrice")];
        let groups = group_by_category(Side::Read, &functions);
        let names: Vec<_> = groups[&Category::StateAndBalances]
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, ["totalStaked", "balanceOf", "getPrice"]);
    }

    #[test]
    fn test_empty_categories_are_omitted() {
        let groups = group_by_category(Side::Write, &[write("mint")]);
        assert_eq!(groups.len(), 1);
        assert!(groups.contains_key(&Category::TokenOperations));
        assert!(group_by_category(Side::Read, &[]).is_empty());
    }
}
