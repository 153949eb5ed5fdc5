//! Distribution-shift scoring. PSI bins follow the baseline's quantiles;
//! categorical shift uses Jensen-Shannon divergence.

use std::collections::HashMap;
use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

const EPSILON: f64 = 1e-6;

/// Quantile bin edges from the baseline sample. Degenerate baselines
/// collapse to fewer distinct edges.
fn quantile_edges(baseline: &[f64], bins: usize) -> Vec<f64> {
    let mut sorted = baseline.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut edges = Vec::with_capacity(bins.saturating_sub(1));
    for i in 1..bins {
        let rank = (i * sorted.len()) / bins;
        let edge = sorted[rank.min(sorted.len() - 1)];
        if edges.last().map(|last| *last < edge).unwrap_or(true) {
            edges.push(edge);
        }
    }
    edges
}

fn bin_proportions(values: &[f64], edges: &[f64]) -> Vec<f64> {
    let mut counts = vec![0_usize; edges.len() + 1];
    for value in values {
        let bin = edges.partition_point(|edge| value > edge);
        counts[bin] += 1;
    }
    counts
        .iter()
        .map(|count| *count as f64 / values.len().max(1) as f64)
        .collect()
}

/// PSI between a baseline and a current sample, binned on the baseline's
/// quantiles. Empty inputs score 0.
#[must_use]
pub fn population_stability_index(baseline: &[f64], current: &[f64], bins: usize) -> f64 {
    if baseline.is_empty() || current.is_empty() {
        return 0.0;
    }
    let edges = quantile_edges(baseline, bins.max(2));
    let base = bin_proportions(baseline, &edges);
    let cur = bin_proportions(current, &edges);
    base.iter()
        .zip(cur.iter())
        .map(|(b, c)| {
            let b = b.max(EPSILON);
            let c = c.max(EPSILON);
            (c - b) * (c / b).ln()
        })
        .sum()
}

/// Jensen-Shannon divergence between two categorical count maps, in
/// nats; bounded by ln 2.
#[must_use]
pub fn js_divergence(left: &HashMap<String, u64>, right: &HashMap<String, u64>) -> f64 {
    let left_total: u64 = left.values().sum();
    let right_total: u64 = right.values().sum();
    if left_total == 0 || right_total == 0 {
        return 0.0;
    }
    let keys: HashSet<&String> = left.keys().chain(right.keys()).collect();
    let mut divergence = 0.0;
    for key in keys {
        let p = *left.get(key).unwrap_or(&0) as f64 / left_total as f64;
        let q = *right.get(key).unwrap_or(&0) as f64 / right_total as f64;
        let m = (p + q) / 2.0;
        if p > 0.0 {
            divergence += 0.5 * p * (p / m).ln();
        }
        if q > 0.0 {
            divergence += 0.5 * q * (q / m).ln();
        }
    }
    divergence
}

/// Top-K terms of a description corpus by TF-IDF mass, with their
/// normalized frequency. The same term set must score both windows so
/// the PSI bins line up.
#[must_use]
pub fn top_terms(descriptions: &[String], k: usize) -> Vec<String> {
    let mut term_count: HashMap<String, u64> = HashMap::new();
    let mut doc_count: HashMap<String, u64> = HashMap::new();
    for description in descriptions {
        let normalized = tally_vendor::normalize(description);
        let mut seen = HashSet::new();
        for term in normalized.split_whitespace() {
            *term_count.entry(term.to_owned()).or_insert(0) += 1;
            if seen.insert(term.to_owned()) {
                *doc_count.entry(term.to_owned()).or_insert(0) += 1;
            }
        }
    }
    let docs = descriptions.len().max(1) as f64;
    let mut scored: Vec<(String, f64)> = term_count
        .into_iter()
        .map(|(term, count)| {
            let df = *doc_count.get(&term).unwrap_or(&1) as f64;
            let idf = (docs / df).ln() + 1.0;
            let score = count as f64 * idf;
            (term, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(k);
    scored.into_iter().map(|(term, _)| term).collect()
}

fn term_distribution(descriptions: &[String], terms: &[String]) -> Vec<f64> {
    let mut counts = vec![0_u64; terms.len() + 1];
    let index: HashMap<&str, usize> = terms
        .iter()
        .enumerate()
        .map(|(i, term)| (term.as_str(), i))
        .collect();
    for description in descriptions {
        let normalized = tally_vendor::normalize(description);
        for term in normalized.split_whitespace() {
            match index.get(term) {
                Some(i) => counts[*i] += 1,
                None => counts[terms.len()] += 1,
            }
        }
    }
    let total: u64 = counts.iter().sum();
    counts
        .iter()
        .map(|count| *count as f64 / total.max(1) as f64)
        .collect()
}

/// PSI over the baseline's top-K TF-IDF terms (plus an out-of-vocabulary
/// bucket).
#[must_use]
pub fn term_psi(baseline: &[String], current: &[String], k: usize) -> f64 {
    if baseline.is_empty() || current.is_empty() {
        return 0.0;
    }
    let terms = top_terms(baseline, k);
    let base = term_distribution(baseline, &terms);
    let cur = term_distribution(current, &terms);
    base.iter()
        .zip(cur.iter())
        .map(|(b, c)| {
            let b = b.max(EPSILON);
            let c = c.max(EPSILON);
            (c - b) * (c / b).ln()
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftThresholds {
    pub psi_warn: f64,
    pub psi_alert: f64,
    /// Accuracy drop, in percentage points, that counts as drift.
    pub acc_drop_pp: f64,
    pub js_alert: f64,
    pub min_new_records: usize,
    pub min_days_since_train: i64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            psi_warn: 0.10,
            psi_alert: 0.25,
            acc_drop_pp: 3.0,
            js_alert: 0.10,
            min_new_records: 1000,
            min_days_since_train: 7,
        }
    }
}

/// One observation window handed to the monitor.
#[derive(Debug, Clone, Default)]
pub struct DriftWindow {
    pub amounts_minor: Vec<f64>,
    pub descriptions: Vec<String>,
    pub account_usage: HashMap<String, u64>,
    pub ocr_confidences: Vec<f64>,
}

/// Bookkeeping about the serving model, for the retrain scheduling
/// conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainState {
    pub new_records_since_train: usize,
    pub days_since_train: i64,
    /// Rolling accuracy now vs. the last retrain checkpoint, in
    /// percentage points (positive = dropped).
    pub accuracy_drop_pp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftTier {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub psi_amount: f64,
    pub psi_terms: f64,
    pub js_accounts: f64,
    pub psi_ocr_confidence: f64,
    pub accuracy_drop_pp: f64,
    pub tier: DriftTier,
    /// Human-readable drift reasons, recorded on any retrain they cause.
    pub reasons: Vec<String>,
}

impl DriftReport {
    #[must_use]
    pub fn should_retrain(&self) -> bool {
        self.tier >= DriftTier::Medium
    }
}

/// Scores the current window against the baseline and decides a tier.
#[must_use]
pub fn assess_drift(
    baseline: &DriftWindow,
    current: &DriftWindow,
    state: TrainState,
    thresholds: DriftThresholds,
) -> DriftReport {
    let psi_amount =
        population_stability_index(&baseline.amounts_minor, &current.amounts_minor, 10);
    let psi_terms = term_psi(&baseline.descriptions, &current.descriptions, 50);
    let js_accounts = js_divergence(&baseline.account_usage, &current.account_usage);
    let psi_ocr_confidence =
        population_stability_index(&baseline.ocr_confidences, &current.ocr_confidences, 10);

    let mut reasons = Vec::new();
    let mut alerts = 0_usize;
    let mut warns = 0_usize;
    for (name, psi) in [
        ("amount", psi_amount),
        ("terms", psi_terms),
        ("ocr_confidence", psi_ocr_confidence),
    ] {
        if psi >= thresholds.psi_alert {
            alerts += 1;
            reasons.push(format!("psi({name})={psi:.3} >= alert {:.2}", thresholds.psi_alert));
        } else if psi >= thresholds.psi_warn {
            warns += 1;
            reasons.push(format!("psi({name})={psi:.3} >= warn {:.2}", thresholds.psi_warn));
        }
    }
    if js_accounts >= thresholds.js_alert {
        alerts += 1;
        reasons.push(format!(
            "js(accounts)={js_accounts:.3} >= alert {:.2}",
            thresholds.js_alert
        ));
    }
    let accuracy_tripped = state.accuracy_drop_pp >= thresholds.acc_drop_pp;
    if accuracy_tripped {
        alerts += 1;
        reasons.push(format!(
            "accuracy dropped {:.1}pp >= {:.1}pp",
            state.accuracy_drop_pp, thresholds.acc_drop_pp
        ));
    }

    let retrain_window_open = state.new_records_since_train >= thresholds.min_new_records
        || state.days_since_train >= thresholds.min_days_since_train;

    let tier = if alerts >= 2 {
        DriftTier::High
    } else if alerts == 1 && retrain_window_open {
        DriftTier::Medium
    } else if alerts == 1 || warns > 0 {
        DriftTier::Low
    } else {
        DriftTier::None
    };

    if tier > DriftTier::None {
        info!(?tier, psi_amount, psi_terms, js_accounts, "drift detected");
    }

    DriftReport {
        psi_amount,
        psi_terms,
        js_accounts,
        psi_ocr_confidence,
        accuracy_drop_pp: state.accuracy_drop_pp,
        tier,
        reasons,
    }
}
