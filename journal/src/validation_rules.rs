// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! On-chain block validation rules.
//!
//! Stored as one string at `sawtooth.validator.block_validation_rules`:
//! rules separated by `;`, each `name:arg,arg,…`, whitespace ignored.

use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationRule {
    /// At most `limit` transactions of `family` per block.
    NofX { limit: usize, family: String },
    /// The transaction at `position` (negative counts from the end) must be
    /// of `family`; a position outside the block invalidates it.
    XatY { family: String, position: i64 },
    /// The listed transaction positions must be signed by the block signer.
    Local { positions: Vec<i64> },
}

/// Parses the rule string. Malformed or unknown rules are skipped with a
/// warning rather than failing the block; only rules that parse are
/// enforced.
pub fn parse_validation_rules(rules: &str) -> Vec<ValidationRule> {
    let cleaned: String = rules.chars().filter(|c| !c.is_whitespace()).collect();
    cleaned
        .split(';')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let (name, args) = entry.split_once(':')?;
            let args: Vec<&str> = args.split(',').collect();
            let parsed = match name {
                "NofX" => {
                    if args.len() != 2 {
                        None
                    } else {
                        args[0].parse().ok().map(|limit| ValidationRule::NofX {
                            limit,
                            family: args[1].to_string(),
                        })
                    }
                }
                "XatY" => {
                    if args.len() != 2 {
                        None
                    } else {
                        args[1].parse().ok().map(|position| ValidationRule::XatY {
                            family: args[0].to_string(),
                            position,
                        })
                    }
                }
                "local" => {
                    let positions: Option<Vec<i64>> =
                        args.iter().map(|arg| arg.parse().ok()).collect();
                    positions.map(|positions| ValidationRule::Local { positions })
                }
                _ => None,
            };
            if parsed.is_none() {
                warn!(rule = entry, "ignoring unparseable block validation rule");
            }
            parsed
        })
        .collect()
}

/// One flattened transaction of a block, in block order.
pub struct RuleSubject<'a> {
    pub family_name: &'a str,
    pub signer_public_key: &'a str,
}

fn resolve_position(position: i64, len: usize) -> Option<usize> {
    if position >= 0 {
        let index = position as usize;
        (index < len).then_some(index)
    } else {
        len.checked_sub(position.unsigned_abs() as usize)
    }
}

/// Checks every rule against the block's flattened transaction list.
/// Returns the first violation as an error string.
pub fn enforce_validation_rules(
    rules: &[ValidationRule],
    block_signer: &str,
    transactions: &[RuleSubject<'_>],
) -> Result<(), String> {
    for rule in rules {
        match rule {
            ValidationRule::NofX { limit, family } => {
                let count = transactions
                    .iter()
                    .filter(|txn| txn.family_name == family)
                    .count();
                if count > *limit {
                    return Err(format!(
                        "NofX: {count} transactions of {family}, at most {limit} allowed"
                    ));
                }
            }
            ValidationRule::XatY { family, position } => {
                let Some(index) = resolve_position(*position, transactions.len()) else {
                    return Err(format!(
                        "XatY: position {position} outside block of {} transactions",
                        transactions.len()
                    ));
                };
                if transactions[index].family_name != family {
                    return Err(format!(
                        "XatY: transaction at {position} is {}, expected {family}",
                        transactions[index].family_name
                    ));
                }
            }
            ValidationRule::Local { positions } => {
                for position in positions {
                    let Some(index) = resolve_position(*position, transactions.len()) else {
                        return Err(format!(
                            "local: position {position} outside block of {} transactions",
                            transactions.len()
                        ));
                    };
                    if transactions[index].signer_public_key != block_signer {
                        return Err(format!(
                            "local: transaction at {position} not signed by the block signer"
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    fn subjects<'a>(entries: &'a [(&'a str, &'a str)]) -> Vec<RuleSubject<'a>> {
        entries
            .iter()
            .map(|(family_name, signer_public_key)| RuleSubject {
                family_name,
                signer_public_key,
            })
            .collect()
    }

    #[test]
    fn parses_the_documented_grammar() {
        let rules = parse_validation_rules("NofX : 2 , intkey ; XatY:block_info,0 ; local:0,-1");
        assert_eq!(
            rules,
            vec![
                ValidationRule::NofX {
                    limit: 2,
                    family: "intkey".to_string()
                },
                ValidationRule::XatY {
                    family: "block_info".to_string(),
                    position: 0
                },
                ValidationRule::Local {
                    positions: vec![0, -1]
                },
            ]
        );
    }

    #[test]
    fn unknown_and_malformed_rules_are_skipped() {
        assert!(parse_validation_rules("frobnicate:1;NofX:notanumber,intkey;;").is_empty());
    }

    #[test]
    fn nofx_counts_per_family() {
        let rules = parse_validation_rules("NofX:1,intkey");
        let txns = subjects(&[("intkey", "k1"), ("settings", "k1")]);
        assert_ok!(enforce_validation_rules(&rules, "k1", &txns));
        let txns = subjects(&[("intkey", "k1"), ("intkey", "k1")]);
        assert_err!(enforce_validation_rules(&rules, "k1", &txns));
    }

    #[test]
    fn xaty_resolves_negative_positions_from_the_end() {
        let rules = parse_validation_rules("XatY:block_info,-1");
        let txns = subjects(&[("intkey", "k1"), ("block_info", "k1")]);
        assert_ok!(enforce_validation_rules(&rules, "k1", &txns));

        let txns = subjects(&[("block_info", "k1"), ("intkey", "k1")]);
        assert_err!(enforce_validation_rules(&rules, "k1", &txns));
    }

    #[test]
    fn xaty_out_of_range_invalidates() {
        let rules = parse_validation_rules("XatY:block_info,5");
        let txns = subjects(&[("block_info", "k1")]);
        assert_err!(enforce_validation_rules(&rules, "k1", &txns));
    }

    #[test]
    fn local_requires_the_block_signer() {
        let rules = parse_validation_rules("local:0");
        let txns = subjects(&[("intkey", "block_signer")]);
        assert_ok!(enforce_validation_rules(&rules, "block_signer", &txns));
        assert_err!(enforce_validation_rules(&rules, "other_signer", &txns));
    }
}
