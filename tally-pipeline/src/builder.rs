//! Double-entry construction for one categorized transaction. Exactly
//! two lines, the bank's sign deciding which side the category takes.

use tally_journal::AccountCode;
use tally_journal::DecisionTrace;
use tally_journal::EntryStatus;
use tally_journal::InvariantError;
use tally_journal::JELine;
use tally_journal::JournalEntry;
use tally_journal::TenantSettings;
use tally_journal::Transaction;

/// Builds the candidate entry for `txn` categorized as `account_code`.
/// The cash side comes from the tenant's source-file mapping; a missing
/// mapping is an invariant error the gate turns into an imbalance
/// review.
pub fn build_entry(
    je_id: String,
    txn: &Transaction,
    account_code: &AccountCode,
    settings: &TenantSettings,
    confidence: f64,
    calibrated_p: Option<f64>,
    rationale: String,
    decision_trace: DecisionTrace,
) -> Result<JournalEntry, InvariantError> {
    let cash_account = settings
        .cash_account_for(&txn.source_file_id)
        .ok_or_else(|| InvariantError::MissingCashMapping(txn.source_file_id.clone()))?;
    let magnitude = txn
        .amount_minor
        .checked_abs()
        .ok_or_else(|| InvariantError::Validation("amount overflow".into()))?;
    if magnitude == 0 {
        return Err(InvariantError::Validation(format!(
            "transaction {} has zero amount",
            txn.txn_id
        )));
    }

    // Money out: the categorized account takes the debit (expense
    // increase), cash is credited. Money in mirrors that.
    let (debit_account, credit_account) = if txn.amount_minor < 0 {
        (account_code, cash_account)
    } else {
        (cash_account, account_code)
    };

    let memo = txn
        .memo
        .clone()
        .unwrap_or_else(|| txn.description_raw.clone());
    let entry = JournalEntry {
        je_id,
        tenant_id: txn.tenant_id.clone(),
        txn_id: Some(txn.txn_id.clone()),
        posted_at: txn.posted_at,
        status: EntryStatus::Proposed,
        currency: txn.currency.clone(),
        confidence,
        calibrated_p,
        rationale,
        rule_version_id: decision_trace.rule_version_id.clone(),
        model_version_id: decision_trace.model_version_id.clone(),
        review_reason: None,
        decision_trace,
        lines: vec![
            JELine {
                line_no: 1,
                account_code: debit_account.clone(),
                debit_minor: magnitude,
                credit_minor: 0,
                memo: Some(memo.clone()),
            },
            JELine {
                line_no: 2,
                account_code: credit_account.clone(),
                debit_minor: 0,
                credit_minor: magnitude,
                memo: Some(memo),
            },
        ],
        reverses_entry_id: None,
        reversed_by_entry_id: None,
    };
    entry.validate()?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn txn(amount_minor: i64) -> Transaction {
        Transaction {
            txn_id: "txn-1".into(),
            tenant_id: "tenant-1".into(),
            posted_at: NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date"),
            amount_minor,
            currency: "USD".into(),
            description_raw: "AMZN Mktp US*RT5WQ9".into(),
            counterparty_raw: Some("AMAZON".into()),
            counterparty_norm: Some("amazon".into()),
            memo: None,
            mcc: None,
            source_file_id: "upload-1".into(),
            source_row_ref: "row:3".into(),
            ingested_at: Utc::now(),
        }
    }

    fn settings() -> TenantSettings {
        let mut settings = TenantSettings::default();
        settings
            .cash_account_by_source
            .insert("upload-1".into(), "1000".into());
        settings
    }

    #[test]
    fn outflow_debits_the_category() {
        let entry = build_entry(
            "je-1".into(),
            &txn(-1245),
            &"6100".to_owned(),
            &settings(),
            0.94,
            Some(0.95),
            "rule amazon".into(),
            DecisionTrace::default(),
        )
        .expect("build");

        assert!(entry.is_balanced());
        assert_eq!(entry.lines.len(), 2);
        assert_eq!(entry.lines[0].account_code, "6100");
        assert_eq!(entry.lines[0].debit_minor, 1245);
        assert_eq!(entry.lines[1].account_code, "1000");
        assert_eq!(entry.lines[1].credit_minor, 1245);
        assert_eq!(entry.status, EntryStatus::Proposed);
        assert_eq!(entry.confidence, 0.94);
    }

    #[test]
    fn inflow_debits_cash() {
        let entry = build_entry(
            "je-1".into(),
            &txn(250_000),
            &"4000".to_owned(),
            &settings(),
            0.9,
            Some(0.91),
            "payroll".into(),
            DecisionTrace::default(),
        )
        .expect("build");

        assert_eq!(entry.lines[0].account_code, "1000");
        assert_eq!(entry.lines[0].debit_minor, 250_000);
        assert_eq!(entry.lines[1].account_code, "4000");
        assert_eq!(entry.lines[1].credit_minor, 250_000);
    }

    #[test]
    fn missing_cash_mapping_is_an_error() {
        let bare = TenantSettings::default();
        let err = build_entry(
            "je-1".into(),
            &txn(-1245),
            &"6100".to_owned(),
            &bare,
            0.9,
            None,
            "test".into(),
            DecisionTrace::default(),
        )
        .unwrap_err();
        assert!(matches!(err, InvariantError::MissingCashMapping(_)));
    }

    #[test]
    fn memo_falls_back_to_description() {
        let entry = build_entry(
            "je-1".into(),
            &txn(-1245),
            &"6100".to_owned(),
            &settings(),
            0.9,
            None,
            "test".into(),
            DecisionTrace::default(),
        )
        .expect("build");
        assert_eq!(entry.lines[0].memo.as_deref(), Some("AMZN Mktp US*RT5WQ9"));
    }
}
