#![deny(clippy::print_stdout, clippy::print_stderr)]

use regex_lite::Regex;
use thiserror::Error;

use tally_journal::AccountCode;
use tally_journal::ConcurrencyError;
use tally_journal::RuleDefinition;
use tally_journal::RuleId;
use tally_journal::RuleMatchType;
use tally_journal::RuleVersion;
use tally_journal::StorageError;
use tally_journal::Transaction;

mod dry_run;
mod promoter;
mod version_store;

pub use dry_run::DryRunImpact;
pub use dry_run::dry_run_impact;
pub use promoter::PromotionPolicy;
pub use promoter::RulePromoter;
pub use version_store::RULES_POINTER;
pub use version_store::RuleVersionStore;

pub type RulesResult<T> = Result<T, RulesError>;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error("audit sink failure: {0}")]
    Audit(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule_id: RuleId,
    pub match_type: RuleMatchType,
    pub pattern: String,
    pub account_code: AccountCode,
    pub priority: i32,
}

impl RuleMatch {
    fn from_rule(rule: &RuleDefinition) -> Self {
        Self {
            rule_id: rule.id.clone(),
            match_type: rule.match_type,
            pattern: rule.pattern.clone(),
            account_code: rule.account_code.clone(),
            priority: rule.priority,
        }
    }
}

/// Outcome of evaluating one transaction against a rule version. The
/// first match at the winning priority is authoritative; a conflict is
/// two winning-priority matches naming different accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleEvaluation {
    pub matched: Option<RuleMatch>,
    pub conflicting: Vec<RuleMatch>,
}

impl RuleEvaluation {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        !self.conflicting.is_empty()
    }
}

/// Stateless matcher over an immutable rule version. Safe to share across
/// concurrently processed transactions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEngine;

impl RuleEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, version: &RuleVersion, txn: &Transaction) -> RuleEvaluation {
        let vendor_norm = txn
            .counterparty_norm
            .clone()
            .or_else(|| txn.counterparty_raw.as_deref().map(tally_vendor::normalize))
            .unwrap_or_default();
        let description_norm = tally_vendor::normalize(&txn.description_raw);
        let memo_norm = txn.memo.as_deref().map(tally_vendor::normalize);

        let mut hits: Vec<RuleMatch> = Vec::new();
        for rule in &version.rules {
            let matched = match rule.match_type {
                RuleMatchType::Exact => {
                    !vendor_norm.is_empty() && rule.pattern == vendor_norm
                }
                RuleMatchType::Regex => match Regex::new(&rule.pattern) {
                    Ok(re) => re.is_match(&description_norm) || re.is_match(&vendor_norm),
                    Err(_) => false,
                },
                RuleMatchType::Mcc => txn
                    .mcc
                    .as_deref()
                    .map(|mcc| mcc == rule.pattern)
                    .unwrap_or(false),
                RuleMatchType::MemoSubstring => memo_norm
                    .as_deref()
                    .map(|memo| memo.contains(&rule.pattern))
                    .unwrap_or(false),
            };
            if matched {
                hits.push(RuleMatch::from_rule(rule));
            }
        }

        let Some(best_priority) = hits.iter().map(|hit| hit.priority).max() else {
            return RuleEvaluation::default();
        };
        let mut winners = hits;
        winners.retain(|hit| hit.priority == best_priority);

        let first_account = winners[0].account_code.clone();
        let conflicting = if winners
            .iter()
            .any(|winner| winner.account_code != first_account)
        {
            winners.clone()
        } else {
            Vec::new()
        };

        RuleEvaluation {
            matched: winners.into_iter().next(),
            conflicting,
        }
    }
}
