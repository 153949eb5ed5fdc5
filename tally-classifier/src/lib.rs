#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Multi-class account classifier. A multinomial naive-Bayes model over
//! text and shape features; single predictions are a handful of hash
//! lookups, so bulk scoring is just a loop.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

use tally_journal::AccountCode;
use tally_journal::ModelVersionId;
use tally_journal::Transaction;

mod calibration;
mod eval;

pub use calibration::apply_calibration;
pub use calibration::brier_score;
pub use calibration::expected_calibration_error;
pub use calibration::fit_isotonic;
pub use calibration::fit_temperature;
pub use calibration::per_bin_gaps;
pub use eval::EvalReport;
pub use eval::evaluate;

pub type ClassifierResult<T> = Result<T, ClassifierError>;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("training set is unusable: {0}")]
    Training(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// One labeled transaction for training or evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledExample {
    pub txn: Transaction,
    pub account_code: AccountCode,
}

/// Log-spaced bucket index for an absolute minor amount: 0 for < 100,
/// then one bucket per decade-ish step.
fn amount_bucket(amount_minor: i64) -> u32 {
    let magnitude = amount_minor.unsigned_abs();
    if magnitude < 100 {
        return 0;
    }
    let mut bucket = 0_u32;
    let mut bound = 100_u64;
    while magnitude >= bound && bucket < 12 {
        bucket += 1;
        bound = bound.saturating_mul(4);
    }
    bucket
}

/// Feature tokens for one transaction. Deterministic; the model never
/// sees raw text.
#[must_use]
pub fn features(txn: &Transaction) -> Vec<String> {
    let description_norm = tally_vendor::normalize(&txn.description_raw);
    let counterparty_norm = txn
        .counterparty_norm
        .clone()
        .or_else(|| txn.counterparty_raw.as_deref().map(tally_vendor::normalize))
        .unwrap_or_default();

    let mut tokens = Vec::new();
    for word in description_norm.split_whitespace() {
        tokens.push(format!("w:{word}"));
        let chars: Vec<char> = word.chars().collect();
        if chars.len() >= 3 {
            for window in chars.windows(3) {
                tokens.push(format!("c:{}", window.iter().collect::<String>()));
            }
        }
    }
    if !counterparty_norm.is_empty() {
        tokens.push(format!("v:{counterparty_norm}"));
    }
    tokens.push(format!("amt:{}", amount_bucket(txn.amount_minor)));
    tokens.push(format!(
        "sign:{}",
        if txn.amount_minor < 0 { "out" } else { "in" }
    ));
    tokens.push(format!("dow:{}", txn.posted_at.weekday().num_days_from_monday()));
    if let Some(mcc) = &txn.mcc {
        tokens.push(format!("mcc:{mcc}"));
    }
    tokens
}

/// Per-account probability for one transaction, descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_version_id: ModelVersionId,
    pub distribution: Vec<(AccountCode, f64)>,
}

impl Prediction {
    #[must_use]
    pub fn top(&self) -> Option<(&AccountCode, f64)> {
        self.distribution.first().map(|(code, p)| (code, *p))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountClassifier {
    pub model_version_id: ModelVersionId,
    pub trained_at: DateTime<Utc>,
    pub train_n: usize,
    classes: Vec<AccountCode>,
    class_log_prior: Vec<f64>,
    /// token -> per-class log likelihood.
    feature_log_prob: HashMap<String, Vec<f64>>,
    /// Laplace fallback for tokens seen at training time in other
    /// classes only.
    unseen_log_prob: Vec<f64>,
}

impl AccountClassifier {
    /// Fits token counts with Laplace smoothing. The model version id is
    /// a content hash, so identical training data yields an identical id.
    pub fn train(examples: &[LabeledExample], trained_at: DateTime<Utc>) -> ClassifierResult<Self> {
        if examples.is_empty() {
            return Err(ClassifierError::Training("no training examples".into()));
        }
        let mut classes: Vec<AccountCode> = examples
            .iter()
            .map(|example| example.account_code.clone())
            .collect();
        classes.sort();
        classes.dedup();
        if classes.len() < 2 {
            return Err(ClassifierError::Training(
                "need at least two distinct accounts".into(),
            ));
        }
        let class_index: HashMap<&AccountCode, usize> = classes
            .iter()
            .enumerate()
            .map(|(index, code)| (code, index))
            .collect();

        let mut class_counts = vec![0_usize; classes.len()];
        let mut token_counts: HashMap<String, Vec<f64>> = HashMap::new();
        let mut class_token_totals = vec![0.0_f64; classes.len()];

        for example in examples {
            let class = class_index[&example.account_code];
            class_counts[class] += 1;
            for token in features(&example.txn) {
                token_counts
                    .entry(token)
                    .or_insert_with(|| vec![0.0; classes.len()])[class] += 1.0;
                class_token_totals[class] += 1.0;
            }
        }

        let vocab = token_counts.len() as f64;
        let total = examples.len() as f64;
        let class_log_prior: Vec<f64> = class_counts
            .iter()
            .map(|count| (*count as f64 / total).ln())
            .collect();
        let unseen_log_prob: Vec<f64> = class_token_totals
            .iter()
            .map(|class_total| (1.0 / (class_total + vocab)).ln())
            .collect();
        let feature_log_prob: HashMap<String, Vec<f64>> = token_counts
            .into_iter()
            .map(|(token, counts)| {
                let log_probs = counts
                    .iter()
                    .zip(class_token_totals.iter())
                    .map(|(count, class_total)| ((count + 1.0) / (class_total + vocab)).ln())
                    .collect();
                (token, log_probs)
            })
            .collect();

        let mut model = Self {
            model_version_id: String::new(),
            trained_at,
            train_n: examples.len(),
            classes,
            class_log_prior,
            feature_log_prob,
            unseen_log_prob,
        };
        model.model_version_id = model.content_version_id()?;
        Ok(model)
    }

    fn content_version_id(&self) -> ClassifierResult<ModelVersionId> {
        // Hash over a deterministic rendering: sorted tokens, fixed float
        // formatting.
        let mut hasher = Sha256::new();
        hasher.update(self.trained_at.timestamp_millis().to_be_bytes());
        for class in &self.classes {
            hasher.update(class.as_bytes());
            hasher.update(b"|");
        }
        let mut tokens: Vec<&String> = self.feature_log_prob.keys().collect();
        tokens.sort();
        for token in tokens {
            hasher.update(token.as_bytes());
            for value in &self.feature_log_prob[token] {
                hasher.update(value.to_bits().to_be_bytes());
            }
        }
        let digest = format!("{:x}", hasher.finalize());
        Ok(format!("m-{}", &digest[..16]))
    }

    #[must_use]
    pub fn classes(&self) -> &[AccountCode] {
        &self.classes
    }

    /// Serialized model bytes for the artifact store.
    pub fn to_artifact(&self) -> ClassifierResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| ClassifierError::Validation(format!("unserializable model: {err}")))
    }

    pub fn from_artifact(bytes: &[u8]) -> ClassifierResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| ClassifierError::Validation(format!("unreadable model: {err}")))
    }

    /// Pre-calibration distribution over all known accounts.
    #[must_use]
    pub fn predict(&self, txn: &Transaction) -> Prediction {
        let mut log_scores = self.class_log_prior.clone();
        for token in features(txn) {
            let log_probs = self
                .feature_log_prob
                .get(&token)
                .unwrap_or(&self.unseen_log_prob);
            for (score, log_prob) in log_scores.iter_mut().zip(log_probs.iter()) {
                *score += log_prob;
            }
        }

        // Softmax in log space.
        let max = log_scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut weights: Vec<f64> = log_scores
            .iter()
            .map(|score| (score - max).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        if total > 0.0 {
            for weight in &mut weights {
                *weight /= total;
            }
        }

        let mut distribution: Vec<(AccountCode, f64)> = self
            .classes
            .iter()
            .cloned()
            .zip(weights)
            .collect();
        distribution.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Prediction {
            model_version_id: self.model_version_id.clone(),
            distribution,
        }
    }

    /// Bulk scoring for batch jobs and evaluation.
    #[must_use]
    pub fn predict_batch(&self, txns: &[Transaction]) -> Vec<Prediction> {
        txns.iter().map(|txn| self.predict(txn)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    pub(crate) fn txn(description: &str, counterparty: &str, amount_minor: i64) -> Transaction {
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

    pub(crate) fn training_set() -> Vec<LabeledExample> {
        vec![
            example("AMZN Mktp US", "AMAZON", -1245, "6100"),
            example("AMZN Mktp US*RT5", "AMAZON", -2200, "6100"),
            example("Amazon web services", "AMAZON WEB SERVICES", -5000, "6100"),
            example("UBER *TRIP", "UBER", -1800, "6300"),
            example("UBER *TRIP HELP", "UBER", -2500, "6300"),
            example("LYFT RIDE", "LYFT", -1500, "6300"),
            example("PAYROLL ACME", "ACME CORP", 250_000, "4000"),
            example("PAYROLL ACME OCT", "ACME CORP", 250_000, "4000"),
        ]
    }

    #[test]
    fn learns_to_separate_accounts() {
        let model = AccountClassifier::train(&training_set(), Utc::now()).expect("train");

        let prediction = model.predict(&txn("AMZN Mktp US*ZZ9", "AMAZON", -900));
        let (account, p) = prediction.top().expect("top");
        assert_eq!(account, "6100");
        assert!(p > 0.5, "expected confident top class, got {p}");

        let prediction = model.predict(&txn("UBER *TRIP 10-14", "UBER", -2000));
        assert_eq!(prediction.top().expect("top").0, "6300");

        let prediction = model.predict(&txn("PAYROLL ACME NOV", "ACME CORP", 250_000));
        assert_eq!(prediction.top().expect("top").0, "4000");
    }

    #[test]
    fn distribution_sums_to_one() {
        let model = AccountClassifier::train(&training_set(), Utc::now()).expect("train");
        let prediction = model.predict(&txn("CORNER DELI", "DELI", -700));
        let total: f64 = prediction.distribution.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(prediction.distribution.len(), 3);
    }

    #[test]
    fn model_version_is_content_addressed() {
        let at = Utc::now();
        let a = AccountClassifier::train(&training_set(), at).expect("train");
        let b = AccountClassifier::train(&training_set(), at).expect("train");
        assert_eq!(a.model_version_id, b.model_version_id);

        let mut more = training_set();
        more.push(example("NETFLIX", "NETFLIX", -1599, "6400"));
        let c = AccountClassifier::train(&more, at).expect("train");
        assert_ne!(a.model_version_id, c.model_version_id);
    }

    #[test]
    fn artifact_round_trip_preserves_predictions() {
        let model = AccountClassifier::train(&training_set(), Utc::now()).expect("train");
        let bytes = model.to_artifact().expect("serialize");
        let restored = AccountClassifier::from_artifact(&bytes).expect("deserialize");
        let probe = txn("AMZN Mktp", "AMAZON", -1000);
        assert_eq!(model.predict(&probe), restored.predict(&probe));
    }

    #[test]
    fn training_requires_two_classes() {
        let examples = vec![example("A", "A", -1, "6100")];
        assert!(matches!(
            AccountClassifier::train(&examples, Utc::now()),
            Err(ClassifierError::Training(_))
        ));
    }

    #[test]
    fn amount_buckets_are_log_spaced() {
        assert_eq!(amount_bucket(0), 0);
        assert_eq!(amount_bucket(-99), 0);
        assert_eq!(amount_bucket(100), 1);
        assert_eq!(amount_bucket(-399), 1);
        assert_eq!(amount_bucket(400), 2);
        assert!(amount_bucket(100_000_000) <= 12);
    }
}
