//! Classifier quality metrics used by the retrainer's promotion gates.

use std::collections::HashMap;

use serde::Serialize;

use tally_journal::AccountCode;

use crate::AccountClassifier;
use crate::LabeledExample;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub n: usize,
    pub accuracy: f64,
    pub macro_f1: f64,
    /// Accuracy per true account, for the account-group floor gate.
    pub per_account_accuracy: HashMap<AccountCode, f64>,
    /// (argmax probability, was the argmax correct) per example; feeds
    /// calibration fitting and ECE checks.
    pub score_pairs: Vec<(f64, bool)>,
}

/// Scores a model over labeled examples.
#[must_use]
pub fn evaluate(model: &AccountClassifier, examples: &[LabeledExample]) -> EvalReport {
    let mut correct = 0_usize;
    let mut per_account_total: HashMap<AccountCode, usize> = HashMap::new();
    let mut per_account_correct: HashMap<AccountCode, usize> = HashMap::new();
    // Per-class confusion pieces for F1.
    let mut true_positive: HashMap<AccountCode, usize> = HashMap::new();
    let mut false_positive: HashMap<AccountCode, usize> = HashMap::new();
    let mut false_negative: HashMap<AccountCode, usize> = HashMap::new();
    let mut score_pairs = Vec::with_capacity(examples.len());

    for example in examples {
        let prediction = model.predict(&example.txn);
        let Some((predicted, p)) = prediction.top() else {
            continue;
        };
        let hit = *predicted == example.account_code;
        score_pairs.push((p, hit));
        *per_account_total
            .entry(example.account_code.clone())
            .or_insert(0) += 1;
        if hit {
            correct += 1;
            *per_account_correct
                .entry(example.account_code.clone())
                .or_insert(0) += 1;
            *true_positive.entry(predicted.clone()).or_insert(0) += 1;
        } else {
            *false_positive.entry(predicted.clone()).or_insert(0) += 1;
            *false_negative
                .entry(example.account_code.clone())
                .or_insert(0) += 1;
        }
    }

    let n = score_pairs.len();
    let accuracy = if n == 0 { 0.0 } else { correct as f64 / n as f64 };

    let mut classes: Vec<AccountCode> = per_account_total.keys().cloned().collect();
    for predicted in false_positive.keys() {
        if !classes.contains(predicted) {
            classes.push(predicted.clone());
        }
    }
    classes.sort();
    let macro_f1 = if classes.is_empty() {
        0.0
    } else {
        classes
            .iter()
            .map(|class| {
                let tp = *true_positive.get(class).unwrap_or(&0) as f64;
                let fp = *false_positive.get(class).unwrap_or(&0) as f64;
                let fn_ = *false_negative.get(class).unwrap_or(&0) as f64;
                if tp == 0.0 {
                    0.0
                } else {
                    let precision = tp / (tp + fp);
                    let recall = tp / (tp + fn_);
                    2.0 * precision * recall / (precision + recall)
                }
            })
            .sum::<f64>()
            / classes.len() as f64
    };

    let per_account_accuracy = per_account_total
        .into_iter()
        .map(|(account, total)| {
            let hits = *per_account_correct.get(&account).unwrap_or(&0);
            (account, hits as f64 / total as f64)
        })
        .collect();

    EvalReport {
        n,
        accuracy,
        macro_f1,
        per_account_accuracy,
        score_pairs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tally_journal::Transaction;

    fn txn(description: &str, counterparty: &str, amount_minor: i64) -> Transaction {
        Transaction {
            txn_id: format!("txn-{description}-{amount_minor}"),
            tenant_id: "tenant-1".into(),
            posted_at: NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date"),
            amount_minor,
            currency: "USD".into(),
            description_raw: description.into(),
            counterparty_raw: Some(counterparty.into()),
            counterparty_norm: None,
            memo: None,
            mcc: None,
            source_file_id: "upload-1".into(),
            source_row_ref: "row:1".into(),
            ingested_at: Utc::now(),
        }
    }

    fn example(description: &str, counterparty: &str, amount: i64, account: &str) -> LabeledExample {
        LabeledExample {
            txn: txn(description, counterparty, amount),
            account_code: account.into(),
        }
    }

    fn train_set() -> Vec<LabeledExample> {
        vec![
            example("AMZN Mktp US", "AMAZON", -1245, "6100"),
            example("AMZN Mktp US B", "AMAZON", -2200, "6100"),
            example("UBER *TRIP", "UBER", -1800, "6300"),
            example("UBER *TRIP B", "UBER", -2500, "6300"),
        ]
    }

    #[test]
    fn perfect_holdout_scores_cleanly() {
        let model = AccountClassifier::train(&train_set(), Utc::now()).expect("train");
        let holdout = vec![
            example("AMZN Mktp US C", "AMAZON", -900, "6100"),
            example("UBER *TRIP C", "UBER", -2100, "6300"),
        ];
        let report = evaluate(&model, &holdout);
        assert_eq!(report.n, 2);
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.macro_f1, 1.0);
        assert_eq!(report.per_account_accuracy["6100"], 1.0);
        assert!(report.score_pairs.iter().all(|(_, hit)| *hit));
    }

    #[test]
    fn mislabeled_holdout_lowers_per_account_accuracy() {
        let model = AccountClassifier::train(&train_set(), Utc::now()).expect("train");
        let holdout = vec![
            example("AMZN Mktp US C", "AMAZON", -900, "6100"),
            // Labeled against the model's inevitable prediction.
            example("AMZN Mktp US D", "AMAZON", -900, "6300"),
        ];
        let report = evaluate(&model, &holdout);
        assert_eq!(report.accuracy, 0.5);
        assert_eq!(report.per_account_accuracy["6300"], 0.0);
        assert!(report.macro_f1 < 1.0);
    }

    #[test]
    fn empty_holdout_reports_zeroes() {
        let model = AccountClassifier::train(&train_set(), Utc::now()).expect("train");
        let report = evaluate(&model, &[]);
        assert_eq!(report.n, 0);
        assert_eq!(report.accuracy, 0.0);
    }
}
