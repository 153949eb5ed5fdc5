#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Matches posted journal entries back to source transactions. Exact
//! identity first, then a tolerant single-candidate heuristic; ambiguous
//! windows are deliberately left unmatched. Inputs are sorted
//! canonically, so the same population always reconciles the same way.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

use serde::Serialize;

use tally_journal::EntryStatus;
use tally_journal::JournalEntry;
use tally_journal::JournalEntryId;
use tally_journal::Transaction;
use tally_journal::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Heuristic,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JeMatch {
    pub je_id: JournalEntryId,
    pub match_type: MatchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<TxnId>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub matches: Vec<JeMatch>,
    /// Posted entries no transaction accounts for.
    pub orphan_jes: Vec<JournalEntryId>,
    /// Transactions no posted entry accounts for.
    pub unmatched_txns: Vec<TxnId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilerConfig {
    pub date_tolerance_days: i64,
    date_weight: f64,
    description_weight: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            date_tolerance_days: 3,
            date_weight: 0.7,
            description_weight: 0.3,
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub fn with_tolerance(date_tolerance_days: i64) -> Self {
        Self {
            date_tolerance_days,
            ..Self::default()
        }
    }

    /// Heuristic match quality: date proximity dominates, description
    /// token overlap breaks the remainder.
    fn heuristic_score(&self, date_delta_days: i64, je_text: &str, txn_text: &str) -> f64 {
        let date_component = if self.date_tolerance_days == 0 {
            1.0
        } else {
            (1.0 - date_delta_days.abs() as f64 / (self.date_tolerance_days + 1) as f64)
                .clamp(0.0, 1.0)
        };
        let description_component = token_similarity(je_text, txn_text);
        let total = self.date_weight + self.description_weight;
        ((date_component * self.date_weight + description_component * self.description_weight)
            / total)
            .clamp(0.0, 1.0)
    }
}

fn token_similarity(left: &str, right: &str) -> f64 {
    let tokenize = |input: &str| -> BTreeSet<String> {
        input
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .collect()
    };
    let left_tokens = tokenize(left);
    let right_tokens = tokenize(right);
    if left_tokens.is_empty() || right_tokens.is_empty() {
        return 0.0;
    }
    let intersection = left_tokens.intersection(&right_tokens).count() as f64;
    let union = left_tokens.union(&right_tokens).count() as f64;
    (intersection / union).clamp(0.0, 1.0)
}

fn entry_amount(entry: &JournalEntry) -> i64 {
    entry.lines.iter().map(|line| line.debit_minor).sum()
}

fn entry_text(entry: &JournalEntry) -> String {
    let memos: Vec<&str> = entry
        .lines
        .iter()
        .filter_map(|line| line.memo.as_deref())
        .collect();
    if memos.is_empty() {
        entry.rationale.clone()
    } else {
        memos.join(" ")
    }
}

/// Reconciles posted entries against a transaction population.
#[must_use]
pub fn reconcile(
    entries: &[JournalEntry],
    transactions: &[Transaction],
    config: ReconcilerConfig,
) -> ReconciliationReport {
    // Canonical ordering makes tie-breaks reproducible regardless of the
    // caller's input order.
    let mut posted: Vec<&JournalEntry> = entries
        .iter()
        .filter(|entry| entry.status == EntryStatus::Posted)
        .collect();
    posted.sort_by(|a, b| (a.posted_at, &a.je_id).cmp(&(b.posted_at, &b.je_id)));
    let mut txns: Vec<&Transaction> = transactions.iter().collect();
    txns.sort_by(|a, b| (a.posted_at, &a.txn_id).cmp(&(b.posted_at, &b.txn_id)));

    let by_id: HashMap<&str, &Transaction> = txns.iter().map(|txn| (txn.txn_id.as_str(), *txn)).collect();
    let mut used: HashSet<&str> = HashSet::new();
    let mut matches: Vec<JeMatch> = Vec::with_capacity(posted.len());
    let mut heuristic_queue: Vec<usize> = Vec::new();

    for entry in &posted {
        let amount = entry_amount(entry);
        let exact = entry
            .txn_id
            .as_deref()
            .and_then(|txn_id| by_id.get(txn_id).copied())
            .filter(|txn| {
                !used.contains(txn.txn_id.as_str())
                    && txn.posted_at == entry.posted_at
                    && txn.amount_minor.abs() == amount
            });
        match exact {
            Some(txn) => {
                used.insert(txn.txn_id.as_str());
                matches.push(JeMatch {
                    je_id: entry.je_id.clone(),
                    match_type: MatchType::Exact,
                    txn_id: Some(txn.txn_id.clone()),
                    score: 1.0,
                });
            }
            None => {
                heuristic_queue.push(matches.len());
                matches.push(JeMatch {
                    je_id: entry.je_id.clone(),
                    match_type: MatchType::None,
                    txn_id: None,
                    score: 0.0,
                });
            }
        }
    }

    for match_index in heuristic_queue {
        let entry = posted[match_index];
        let amount = entry_amount(entry);
        let candidates: Vec<&Transaction> = txns
            .iter()
            .filter(|txn| {
                !used.contains(txn.txn_id.as_str())
                    && txn.amount_minor.abs() == amount
                    && (txn.posted_at - entry.posted_at)
                        .num_days()
                        .abs()
                        <= config.date_tolerance_days
            })
            .copied()
            .collect();
        // Two same-amount transactions in the window would make any pick
        // a guess; leave the entry unmatched instead.
        if candidates.len() != 1 {
            continue;
        }
        let txn = candidates[0];
        used.insert(txn.txn_id.as_str());
        let date_delta = (txn.posted_at - entry.posted_at).num_days();
        matches[match_index] = JeMatch {
            je_id: entry.je_id.clone(),
            match_type: MatchType::Heuristic,
            txn_id: Some(txn.txn_id.clone()),
            score: config.heuristic_score(date_delta, &entry_text(entry), &txn.description_raw),
        };
    }

    let orphan_jes = matches
        .iter()
        .filter(|m| m.match_type == MatchType::None)
        .map(|m| m.je_id.clone())
        .collect();
    let unmatched_txns = txns
        .iter()
        .filter(|txn| !used.contains(txn.txn_id.as_str()))
        .map(|txn| txn.txn_id.clone())
        .collect();

    ReconciliationReport {
        matches,
        orphan_jes,
        unmatched_txns,
    }
}
