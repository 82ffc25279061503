//! Witness policy
//!
//! A policy is an expression over the two witness classes, `batch`
//! (witnesses tied to the operations in the batch) and `system` (the
//! node's standing witnesses), such as:
//!
//! ```text
//! MinPercent(100,batch) AND OutOf(1,system)
//! ```
//!
//! Terms are `MinPercent(p,class)` and `OutOf(n,class)`, combined
//! left-associatively with `AND` / `OR`. A class with no selected
//! witnesses satisfies any of its terms.

use std::fmt;

use crate::error::{Error, Result};

/// Witness class referenced by a policy term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessClass {
    Batch,
    System,
}

impl fmt::Display for WitnessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WitnessClass::Batch => f.write_str("batch"),
            WitnessClass::System => f.write_str("system"),
        }
    }
}

/// Proof-collection progress for one witness class
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassState {
    /// Witnesses selected for the batch
    pub selected: usize,
    /// Witnesses that returned a proof
    pub proofs: usize,
}

/// Parsed witness policy expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WitnessPolicy {
    MinPercent(u32, WitnessClass),
    OutOf(usize, WitnessClass),
    And(Box<WitnessPolicy>, Box<WitnessPolicy>),
    Or(Box<WitnessPolicy>, Box<WitnessPolicy>),
}

impl Default for WitnessPolicy {
    fn default() -> Self {
        WitnessPolicy::MinPercent(100, WitnessClass::Batch)
    }
}

impl WitnessPolicy {
    /// Parse a policy expression
    pub fn parse(input: &str) -> Result<Self> {
        let tokens: Vec<&str> = input.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(Error::BadRequest("empty witness policy".to_string()));
        }

        let mut policy = parse_term(tokens[0])?;
        let mut i = 1;

        while i < tokens.len() {
            let op = tokens[i];
            let term = tokens.get(i + 1).ok_or_else(|| {
                Error::BadRequest(format!("witness policy ends after operator [{op}]"))
            })?;
            let term = parse_term(term)?;

            policy = match op {
                "AND" => WitnessPolicy::And(Box::new(policy), Box::new(term)),
                "OR" => WitnessPolicy::Or(Box::new(policy), Box::new(term)),
                other => {
                    return Err(Error::BadRequest(format!(
                        "unknown witness policy operator [{other}]"
                    )))
                }
            };

            i += 2;
        }

        Ok(policy)
    }

    /// Whether the collected proofs satisfy the policy
    pub fn satisfied(&self, batch: &ClassState, system: &ClassState) -> bool {
        match self {
            WitnessPolicy::MinPercent(percent, class) => {
                let state = class_state(*class, batch, system);
                if state.selected == 0 {
                    return true;
                }
                state.proofs * 100 >= *percent as usize * state.selected
            }
            WitnessPolicy::OutOf(count, class) => {
                let state = class_state(*class, batch, system);
                if state.selected == 0 {
                    return true;
                }
                state.proofs >= (*count).min(state.selected)
            }
            WitnessPolicy::And(a, b) => a.satisfied(batch, system) && b.satisfied(batch, system),
            WitnessPolicy::Or(a, b) => a.satisfied(batch, system) || b.satisfied(batch, system),
        }
    }
}

fn class_state(class: WitnessClass, batch: &ClassState, system: &ClassState) -> ClassState {
    match class {
        WitnessClass::Batch => *batch,
        WitnessClass::System => *system,
    }
}

fn parse_term(token: &str) -> Result<WitnessPolicy> {
    let (name, args) = token
        .split_once('(')
        .ok_or_else(|| Error::BadRequest(format!("malformed policy term [{token}]")))?;

    let args = args
        .strip_suffix(')')
        .ok_or_else(|| Error::BadRequest(format!("unclosed policy term [{token}]")))?;

    let (value, class) = args
        .split_once(',')
        .ok_or_else(|| Error::BadRequest(format!("policy term [{token}] needs two arguments")))?;

    let class = match class.trim() {
        "batch" => WitnessClass::Batch,
        "system" => WitnessClass::System,
        other => {
            return Err(Error::BadRequest(format!(
                "unknown witness class [{other}]"
            )))
        }
    };

    match name {
        "MinPercent" => {
            let percent: u32 = value
                .trim()
                .parse()
                .map_err(|_| Error::BadRequest(format!("invalid percentage in [{token}]")))?;
            if percent > 100 {
                return Err(Error::BadRequest(format!(
                    "percentage above 100 in [{token}]"
                )));
            }
            Ok(WitnessPolicy::MinPercent(percent, class))
        }
        "OutOf" => {
            let count: usize = value
                .trim()
                .parse()
                .map_err(|_| Error::BadRequest(format!("invalid count in [{token}]")))?;
            Ok(WitnessPolicy::OutOf(count, class))
        }
        other => Err(Error::BadRequest(format!(
            "unknown policy term [{other}]"
        ))),
    }
}
