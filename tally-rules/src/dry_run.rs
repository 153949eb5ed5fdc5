use serde::Serialize;

use tally_journal::AccountCode;
use tally_journal::RuleVersion;
use tally_journal::Transaction;
use tally_journal::TxnId;

use crate::RuleEngine;

/// One transaction that would change account under the proposed rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reclassification {
    pub txn_id: TxnId,
    pub old_account: AccountCode,
    pub new_account: AccountCode,
}

/// Counterfactual effect of swapping rule versions over a sample of
/// recent transactions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunImpact {
    pub sample_n: usize,
    pub auto_postable_old: usize,
    pub auto_postable_new: usize,
    /// `auto_postable_new - auto_postable_old`.
    pub automation_delta: i64,
    pub reclassifications: Vec<Reclassification>,
    pub reclassified_fraction: f64,
    /// Set when the reclassified fraction exceeds the configured
    /// threshold; operators must force past this explicitly.
    pub flagged: bool,
}

/// Replays a sample against both versions. Rule matches count as
/// auto-postable: deterministic rules bypass the calibrated threshold.
#[must_use]
pub fn dry_run_impact(
    old: &RuleVersion,
    proposed: &RuleVersion,
    sample: &[Transaction],
    reclass_threshold: f64,
) -> DryRunImpact {
    let engine = RuleEngine::new();
    let mut auto_postable_old = 0_usize;
    let mut auto_postable_new = 0_usize;
    let mut reclassifications = Vec::new();

    for txn in sample {
        let before = engine.evaluate(old, txn);
        let after = engine.evaluate(proposed, txn);
        // Conflicted matches route to review, so they are not automatable.
        let old_match = if before.is_conflict() { None } else { before.matched };
        let new_match = if after.is_conflict() { None } else { after.matched };

        if old_match.is_some() {
            auto_postable_old += 1;
        }
        if new_match.is_some() {
            auto_postable_new += 1;
        }
        if let (Some(before), Some(after)) = (old_match, new_match)
            && before.account_code != after.account_code
        {
            reclassifications.push(Reclassification {
                txn_id: txn.txn_id.clone(),
                old_account: before.account_code,
                new_account: after.account_code,
            });
        }
    }

    let reclassified_fraction = if sample.is_empty() {
        0.0
    } else {
        reclassifications.len() as f64 / sample.len() as f64
    };

    DryRunImpact {
        sample_n: sample.len(),
        auto_postable_old,
        auto_postable_new,
        automation_delta: auto_postable_new as i64 - auto_postable_old as i64,
        reclassifications,
        reclassified_fraction,
        flagged: reclassified_fraction > reclass_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tally_journal::RuleDefinition;
    use tally_journal::RuleMatchType;
    use tally_journal::RuleSource;

    fn rule(pattern: &str, account: &str) -> RuleDefinition {
        RuleDefinition {
            id: format!("rule-{pattern}-{account}"),
            match_type: RuleMatchType::Exact,
            pattern: pattern.into(),
            account_code: account.into(),
            priority: 10,
            author: "ops".into(),
            source: RuleSource::Human,
        }
    }

    fn version(id: &str, rules: Vec<RuleDefinition>) -> RuleVersion {
        RuleVersion {
            version_id: id.into(),
            tenant_id: "tenant-1".into(),
            rules,
            created_at: Utc::now(),
            author: "ops".into(),
            notes: String::new(),
            parent_version_id: None,
        }
    }

    fn txn(id: &str, counterparty: &str) -> Transaction {
        Transaction {
            txn_id: id.into(),
            tenant_id: "tenant-1".into(),
            posted_at: NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date"),
            amount_minor: -1000,
            currency: "USD".into(),
            description_raw: counterparty.into(),
            counterparty_raw: Some(counterparty.into()),
            counterparty_norm: None,
            memo: None,
            mcc: None,
            source_file_id: "upload-1".into(),
            source_row_ref: "row:1".into(),
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn measures_automation_gain() {
        let old = version("v1", vec![rule("amazon", "6100")]);
        let new = version(
            "v2",
            vec![rule("amazon", "6100"), rule("uber", "6300")],
        );
        let sample = vec![txn("t1", "AMAZON"), txn("t2", "UBER"), txn("t3", "CAFE")];

        let impact = dry_run_impact(&old, &new, &sample, 0.005);
        assert_eq!(impact.auto_postable_old, 1);
        assert_eq!(impact.auto_postable_new, 2);
        assert_eq!(impact.automation_delta, 1);
        assert!(impact.reclassifications.is_empty());
        assert!(!impact.flagged);
    }

    #[test]
    fn flags_reclassification_above_threshold() {
        let old = version("v1", vec![rule("amazon", "6100")]);
        let new = version("v2", vec![rule("amazon", "6900")]);
        let mut sample: Vec<Transaction> = (0..8)
            .map(|i| txn(&format!("t{i}"), "CAFE"))
            .collect();
        sample.push(txn("t-amz", "AMAZON"));

        // 1 of 9 reclassified, ~11% of the sample.
        let impact = dry_run_impact(&old, &new, &sample, 0.005);
        assert_eq!(impact.reclassifications.len(), 1);
        assert_eq!(impact.reclassifications[0].old_account, "6100");
        assert_eq!(impact.reclassifications[0].new_account, "6900");
        assert!(impact.reclassified_fraction > 0.10);
        assert!(impact.flagged);
    }

    #[test]
    fn empty_sample_is_not_flagged() {
        let old = version("v1", vec![]);
        let new = version("v2", vec![rule("amazon", "6100")]);
        let impact = dry_run_impact(&old, &new, &[], 0.005);
        assert_eq!(impact.sample_n, 0);
        assert!(!impact.flagged);
    }
}
