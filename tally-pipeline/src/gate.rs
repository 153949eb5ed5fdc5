//! Routing gate. Runs after blending and entry building, before anything
//! is committed; every decision leaves with a route and, when routed to
//! review, exactly one reason from the closed set.

use tally_journal::AccountCode;
use tally_journal::JournalEntry;
use tally_journal::NotAutoPostReason;
use tally_journal::Route;
use tally_journal::TenantSettings;
use tally_rules::RuleEvaluation;

use crate::blender::BlendOutcome;

/// History points required before the anomaly band is meaningful.
const ANOMALY_MIN_HISTORY: usize = 8;

#[derive(Debug)]
pub struct GateInputs<'a> {
    pub settings: &'a TenantSettings,
    pub rule: &'a RuleEvaluation,
    pub blend: &'a BlendOutcome,
    /// Calibrated probability for the blend's account; `None` means no
    /// calibration model exists for the serving classifier.
    pub calibrated_p: Option<f64>,
    /// Confirmed accounts for this vendor, newest first.
    pub recent_confirmations: &'a [AccountCode],
    /// Candidate entry from the builder; `None` when building failed.
    pub candidate_entry: Option<&'a JournalEntry>,
    /// The uncertain band required an LLM opinion for this decision.
    pub llm_required: bool,
    /// The LLM signal came back degraded (budget, timeout, outage).
    pub llm_degraded: bool,
    /// Posted line amounts history for the blend's account.
    pub account_history_amounts: &'a [i64],
    pub amount_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub route: Route,
    /// First blocking reason, present exactly when route is review.
    pub reason: Option<NotAutoPostReason>,
    /// Every blocking reason observed, in evaluation order.
    pub reasons: Vec<NotAutoPostReason>,
    /// Anomalous amount observed while the tenant runs the band as
    /// informational; recorded in the trace, does not block.
    pub anomaly_informational: bool,
}

fn median_of(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Robust z-band check: is `amount` outside median ± k·MAD of the
/// account's posted history?
fn is_anomalous(history: &[i64], amount_minor: i64, k: f64) -> bool {
    if history.len() < ANOMALY_MIN_HISTORY {
        return false;
    }
    let mut values: Vec<f64> = history.iter().map(|v| *v as f64).collect();
    values.sort_by(f64::total_cmp);
    let median = median_of(&values);
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    deviations.sort_by(f64::total_cmp);
    let mad = median_of(&deviations);
    let magnitude = amount_minor.unsigned_abs() as f64;
    (magnitude - median).abs() > k * mad
}

/// Applies the gate algorithm in a fixed order; the first reason that
/// fires is the one the routed entry carries.
#[must_use]
pub fn decide(inputs: &GateInputs) -> GateDecision {
    let mut reasons: Vec<NotAutoPostReason> = Vec::new();
    let mut anomaly_informational = false;

    let rule_matched = inputs.rule.matched.is_some() && !inputs.rule.is_conflict();
    let rule_backs_blend = rule_matched
        && inputs
            .rule
            .matched
            .as_ref()
            .map(|m| &m.account_code)
            == inputs.blend.account_code.as_ref();

    // Conflicting rules are never automatable, whatever else holds.
    if inputs.rule.is_conflict() {
        reasons.push(NotAutoPostReason::RuleConflict);
    }

    // Threshold, unless an unconflicted rule backs the blend's account.
    // A missing calibration model disables auto-posting outright, rules
    // included.
    match inputs.calibrated_p {
        None => {
            if !reasons.contains(&NotAutoPostReason::RuleConflict) {
                reasons.push(NotAutoPostReason::BelowThreshold);
            }
        }
        Some(calibrated_p) => {
            let bypass = rule_backs_blend;
            if inputs.blend.account_code.is_none()
                || (!bypass && calibrated_p < inputs.settings.confidence_threshold)
            {
                reasons.push(NotAutoPostReason::BelowThreshold);
            }
        }
    }

    // Cold start: the most recent confirmations must all name the
    // account about to be posted.
    if let Some(account) = &inputs.blend.account_code {
        let recent = inputs.recent_confirmations;
        let warm = recent.len() >= inputs.settings.cold_start_min
            && recent
                .iter()
                .take(inputs.settings.cold_start_min)
                .all(|confirmed| confirmed == account);
        if !warm {
            reasons.push(NotAutoPostReason::ColdStart);
        }
    }

    // Balance: a builder failure or an unbalanced candidate can never
    // post.
    let balanced = inputs
        .candidate_entry
        .map(JournalEntry::is_balanced)
        .unwrap_or(false);
    if !balanced {
        reasons.push(NotAutoPostReason::Imbalance);
    }

    // Budget: the band demanded an LLM opinion that never arrived, and
    // no deterministic rule covers the gap.
    if inputs.llm_required && inputs.llm_degraded && !rule_matched {
        reasons.push(NotAutoPostReason::BudgetFallback);
    }

    // Anomaly band, blocking or informational per tenant.
    if is_anomalous(
        inputs.account_history_amounts,
        inputs.amount_minor,
        inputs.settings.anomaly_mad_k,
    ) {
        if inputs.settings.anomaly_blocks_autopost {
            reasons.push(NotAutoPostReason::Anomaly);
        } else {
            anomaly_informational = true;
        }
    }

    let reason = reasons.first().copied();
    GateDecision {
        route: if reason.is_some() {
            Route::Review
        } else {
            Route::AutoPost
        },
        reason,
        reasons,
        anomaly_informational,
    }
}
