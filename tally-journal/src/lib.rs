#![deny(clippy::print_stdout, clippy::print_stderr)]

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

mod clock;
mod memory;
mod settings;
mod store;
mod trace;

pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use memory::InMemoryBlobStore;
pub use memory::InMemoryStore;
pub use settings::BlendWeights;
pub use settings::SettingsError;
pub use settings::TenantSettings;
pub use settings::UncertainBand;
pub use store::BlobStore;
pub use store::ConditionalInsert;
pub use store::Store;
pub use trace::DecisionTrace;
pub use trace::SignalKind;
pub use trace::TraceSignal;

pub type TenantId = String;
pub type TxnId = String;
pub type JournalEntryId = String;
pub type AccountCode = String;
pub type RuleId = String;
pub type RuleVersionId = String;
pub type ModelVersionId = String;

#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("journal entry {je_id} is unbalanced: debits {debits} != credits {credits}")]
    Unbalanced {
        je_id: JournalEntryId,
        debits: i64,
        credits: i64,
    },
    #[error("line {line_no} must carry exactly one of debit/credit")]
    LineShape { line_no: u32 },
    #[error("no cash account mapping for source {0}")]
    MissingCashMapping(String),
    #[error("unknown account code {0}")]
    UnknownAccount(AccountCode),
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: EntryStatus, to: EntryStatus },
    #[error("unexpected duplicate external id {0}")]
    DuplicateExternalId(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
#[error("lost version swap race on {pointer}: expected {expected:?}")]
pub struct ConcurrencyError {
    pub pointer: String,
    pub expected: Option<String>,
}

/// Closed set of reasons a decision is kept from auto-posting. The gate
/// records exactly one on the routed entry; the trace may carry more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotAutoPostReason {
    BelowThreshold,
    ColdStart,
    Imbalance,
    BudgetFallback,
    Anomaly,
    RuleConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    AutoPost,
    Review,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: TxnId,
    pub tenant_id: TenantId,
    pub posted_at: NaiveDate,
    /// Signed bank-perspective amount in minor currency units.
    pub amount_minor: i64,
    pub currency: String,
    pub description_raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_norm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcc: Option<String>,
    pub source_file_id: String,
    /// Origin row or page reference for audit.
    pub source_row_ref: String,
    pub ingested_at: DateTime<Utc>,
}

impl Transaction {
    pub fn validate(&self) -> Result<(), InvariantError> {
        if self.amount_minor == 0 {
            return Err(InvariantError::Validation(format!(
                "transaction {} has zero amount",
                self.txn_id
            )));
        }
        if !is_iso4217(&self.currency) {
            return Err(InvariantError::Validation(format!(
                "transaction {} carries non ISO-4217 currency {}",
                self.txn_id, self.currency
            )));
        }
        Ok(())
    }

    /// Stable identity of the underlying bank line, independent of the
    /// upload that carried it.
    pub fn dedupe_key(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.tenant_id.as_str(),
            &self.posted_at.to_string(),
            &self.amount_minor.to_string(),
            &self.description_raw,
            self.counterparty_raw.as_deref().unwrap_or(""),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(b"|");
        }
        format!("{:x}", hasher.finalize())
    }
}

pub fn is_iso4217(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|ch| ch.is_ascii_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    /// Side on which an increase is recorded under US-GAAP conventions.
    #[must_use]
    pub fn increase_side(self) -> Side {
        match self {
            AccountType::Asset | AccountType::Expense => Side::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Revenue => Side::Credit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub code: AccountCode,
    pub tenant_id: TenantId,
    pub name: String,
    pub account_type: AccountType,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Proposed,
    Approved,
    Posted,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JELine {
    pub line_no: u32,
    pub account_code: AccountCode,
    pub debit_minor: i64,
    pub credit_minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl JELine {
    pub fn validate(&self) -> Result<(), InvariantError> {
        let debit_set = self.debit_minor > 0;
        let credit_set = self.credit_minor > 0;
        if self.debit_minor < 0 || self.credit_minor < 0 || debit_set == credit_set {
            return Err(InvariantError::LineShape {
                line_no: self.line_no,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub je_id: JournalEntryId,
    pub tenant_id: TenantId,
    /// Adjusting entries authored outside the pipeline carry no source
    /// transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<TxnId>,
    pub posted_at: NaiveDate,
    pub status: EntryStatus,
    pub currency: String,
    /// Blend score from signal fusion.
    pub confidence: f64,
    /// Calibrated classifier probability for the chosen account, when a
    /// calibration model was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibrated_p: Option<f64>,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_version_id: Option<RuleVersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<ModelVersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<NotAutoPostReason>,
    pub decision_trace: DecisionTrace,
    pub lines: Vec<JELine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses_entry_id: Option<JournalEntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_by_entry_id: Option<JournalEntryId>,
}

impl JournalEntry {
    pub fn is_balanced(&self) -> bool {
        let (debits, credits) = self
            .lines
            .iter()
            .fold((0_i64, 0_i64), |(d, c), line| {
                (d + line.debit_minor, c + line.credit_minor)
            });
        debits == credits
    }

    pub fn validate(&self) -> Result<(), InvariantError> {
        for line in &self.lines {
            line.validate()?;
        }
        if !self.is_balanced() {
            let (debits, credits) = self
                .lines
                .iter()
                .fold((0_i64, 0_i64), |(d, c), line| {
                    (d + line.debit_minor, c + line.credit_minor)
                });
            return Err(InvariantError::Unbalanced {
                je_id: self.je_id.clone(),
                debits,
                credits,
            });
        }
        Ok(())
    }

    pub fn approve(&mut self) -> Result<(), InvariantError> {
        self.transition(EntryStatus::Approved)
    }

    pub fn post(&mut self) -> Result<(), InvariantError> {
        self.validate()?;
        self.transition(EntryStatus::Posted)
    }

    fn transition(&mut self, to: EntryStatus) -> Result<(), InvariantError> {
        let allowed = matches!(
            (self.status, to),
            (EntryStatus::Proposed, EntryStatus::Approved)
                | (EntryStatus::Approved, EntryStatus::Posted)
                | (EntryStatus::Posted, EntryStatus::RolledBack)
        );
        if !allowed {
            return Err(InvariantError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        if to == EntryStatus::Posted {
            self.validate()?;
        }
        self.status = to;
        Ok(())
    }

    /// Rolls this entry back by producing a reversing entry. The original
    /// keeps its lines untouched; only its status and back-reference move.
    pub fn roll_back(
        &mut self,
        reversal_id: JournalEntryId,
        posted_at: NaiveDate,
        reason: &str,
    ) -> Result<JournalEntry, InvariantError> {
        if self.status != EntryStatus::Posted {
            return Err(InvariantError::InvalidTransition {
                from: self.status,
                to: EntryStatus::RolledBack,
            });
        }
        let lines = self
            .lines
            .iter()
            .map(|line| JELine {
                line_no: line.line_no,
                account_code: line.account_code.clone(),
                debit_minor: line.credit_minor,
                credit_minor: line.debit_minor,
                memo: line.memo.clone(),
            })
            .collect();
        let reversal = JournalEntry {
            je_id: reversal_id.clone(),
            tenant_id: self.tenant_id.clone(),
            txn_id: self.txn_id.clone(),
            posted_at,
            status: EntryStatus::Proposed,
            currency: self.currency.clone(),
            confidence: 1.0,
            calibrated_p: None,
            rationale: format!("reversal of {}: {reason}", self.je_id),
            rule_version_id: None,
            model_version_id: None,
            review_reason: None,
            decision_trace: DecisionTrace::system(format!("reverses {}", self.je_id)),
            lines,
            reverses_entry_id: Some(self.je_id.clone()),
            reversed_by_entry_id: None,
        };
        self.status = EntryStatus::RolledBack;
        self.reversed_by_entry_id = Some(reversal_id);
        Ok(reversal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatchType {
    Exact,
    Regex,
    Mcc,
    MemoSubstring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Human,
    Promoted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: RuleId,
    pub match_type: RuleMatchType,
    pub pattern: String,
    pub account_code: AccountCode,
    pub priority: i32,
    pub author: String,
    pub source: RuleSource,
}

/// Immutable snapshot of a tenant's active rules. Serialized
/// deterministically so identical snapshots share a content address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleVersion {
    pub version_id: RuleVersionId,
    pub tenant_id: TenantId,
    pub rules: Vec<RuleDefinition>,
    pub created_at: DateTime<Utc>,
    pub author: String,
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version_id: Option<RuleVersionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    UserOverride,
    ModelDisagreement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEvent {
    pub txn_id: TxnId,
    pub confidence: f64,
    pub source: EvidenceSource,
    pub observed_at: DateTime<Utc>,
}

/// Pending rule derived from recurring corrections. The running moments
/// follow Welford's update so evidence never has to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCandidate {
    pub tenant_id: TenantId,
    pub vendor_norm: String,
    pub suggested_account: AccountCode,
    pub obs_count: u64,
    pub mean_conf: f64,
    /// Sum of squared deviations from the running mean (Welford's M2).
    pub m2: f64,
    pub last_seen: DateTime<Utc>,
    pub status: CandidateStatus,
    pub evidence_history: Vec<EvidenceEvent>,
}

impl RuleCandidate {
    #[must_use]
    pub fn new(tenant_id: TenantId, vendor_norm: String, suggested_account: AccountCode) -> Self {
        Self {
            tenant_id,
            vendor_norm,
            suggested_account,
            obs_count: 0,
            mean_conf: 0.0,
            m2: 0.0,
            last_seen: DateTime::<Utc>::MIN_UTC,
            status: CandidateStatus::Pending,
            evidence_history: Vec::new(),
        }
    }

    pub fn observe(&mut self, event: EvidenceEvent) {
        self.obs_count += 1;
        let delta = event.confidence - self.mean_conf;
        self.mean_conf += delta / self.obs_count as f64;
        let delta2 = event.confidence - self.mean_conf;
        self.m2 += delta * delta2;
        self.last_seen = event.observed_at;
        self.evidence_history.push(event);
    }

    /// Sample variance of observed confidences.
    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.obs_count < 2 {
            0.0
        } else {
            self.m2 / (self.obs_count - 1) as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    Isotonic,
    Temperature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationParameters {
    /// Step function fit by pool-adjacent-violators: raw score thresholds
    /// and the calibrated value on each segment.
    Isotonic {
        thresholds: Vec<f64>,
        values: Vec<f64>,
    },
    Temperature { t: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    pub model_version_id: ModelVersionId,
    pub method: CalibrationMethod,
    pub parameters: CalibrationParameters,
    pub trained_at: DateTime<Utc>,
    pub ece: f64,
    pub brier: f64,
    pub bin_edges: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMemoryRecord {
    pub id: String,
    pub tenant_id: TenantId,
    pub vendor_norm: String,
    pub account_code: AccountCode,
    pub embedding: Vec<f32>,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

/// Confirmed (vendor -> account) label, written on human approval or
/// auto-post. Drives the cold-start gate and the rule promoter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub tenant_id: TenantId,
    pub vendor_norm: String,
    pub account_code: AccountCode,
    pub txn_id: TxnId,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Posted,
    SkippedDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub je_id: JournalEntryId,
    pub tenant_id: TenantId,
    /// Full 64-hex SHA-256 of the canonical payload; exports surface the
    /// first 32 hex characters.
    pub external_id: String,
    pub target: String,
    pub first_exported_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: ExportStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainEvent {
    pub id: String,
    pub tenant_id: TenantId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reasons: Vec<String>,
    pub train_n: usize,
    pub valid_n: usize,
    pub acc_old: f64,
    pub acc_new: f64,
    pub f1_old: f64,
    pub f1_new: f64,
    pub promoted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    pub notes: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn entry(lines: Vec<JELine>) -> JournalEntry {
        JournalEntry {
            je_id: "je-1".into(),
            tenant_id: "tenant-1".into(),
            txn_id: Some("txn-1".into()),
            posted_at: NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date"),
            status: EntryStatus::Proposed,
            currency: "USD".into(),
            confidence: 0.92,
            calibrated_p: Some(0.95),
            rationale: "test".into(),
            rule_version_id: None,
            model_version_id: None,
            review_reason: None,
            decision_trace: DecisionTrace::default(),
            lines,
            reverses_entry_id: None,
            reversed_by_entry_id: None,
        }
    }

    fn debit(line_no: u32, account: &str, amount: i64) -> JELine {
        JELine {
            line_no,
            account_code: account.into(),
            debit_minor: amount,
            credit_minor: 0,
            memo: None,
        }
    }

    fn credit(line_no: u32, account: &str, amount: i64) -> JELine {
        JELine {
            line_no,
            account_code: account.into(),
            debit_minor: 0,
            credit_minor: amount,
            memo: None,
        }
    }

    #[test]
    fn balanced_entry_validates() {
        let entry = entry(vec![debit(1, "6100", 1245), credit(2, "1000", 1245)]);
        assert!(entry.is_balanced());
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn unbalanced_entry_is_rejected() {
        let entry = entry(vec![debit(1, "6100", 1245), credit(2, "1000", 1200)]);
        assert!(!entry.is_balanced());
        assert!(matches!(
            entry.validate(),
            Err(InvariantError::Unbalanced { .. })
        ));
    }

    #[test]
    fn line_must_carry_exactly_one_side() {
        let both = JELine {
            line_no: 1,
            account_code: "6100".into(),
            debit_minor: 10,
            credit_minor: 10,
            memo: None,
        };
        assert!(matches!(
            both.validate(),
            Err(InvariantError::LineShape { line_no: 1 })
        ));

        let neither = JELine {
            line_no: 2,
            account_code: "6100".into(),
            debit_minor: 0,
            credit_minor: 0,
            memo: None,
        };
        assert!(neither.validate().is_err());
    }

    #[test]
    fn status_walks_proposed_approved_posted() {
        let mut entry = entry(vec![debit(1, "6100", 500), credit(2, "1000", 500)]);
        entry.approve().expect("approve");
        assert_eq!(entry.status, EntryStatus::Approved);
        entry.post().expect("post");
        assert_eq!(entry.status, EntryStatus::Posted);
        assert!(entry.approve().is_err());
    }

    #[test]
    fn unbalanced_entry_cannot_post() {
        let mut entry = entry(vec![debit(1, "6100", 500), credit(2, "1000", 400)]);
        entry.approve().expect("approve");
        assert!(entry.post().is_err());
        assert_eq!(entry.status, EntryStatus::Approved);
    }

    #[test]
    fn roll_back_produces_mirrored_reversal() {
        let mut entry = entry(vec![debit(1, "6100", 500), credit(2, "1000", 500)]);
        entry.approve().expect("approve");
        entry.post().expect("post");

        let reversal = entry
            .roll_back(
                "je-2".into(),
                NaiveDate::from_ymd_opt(2025, 10, 20).expect("valid date"),
                "operator request",
            )
            .expect("roll back");

        assert_eq!(entry.status, EntryStatus::RolledBack);
        assert_eq!(entry.reversed_by_entry_id.as_deref(), Some("je-2"));
        assert_eq!(reversal.reverses_entry_id.as_deref(), Some("je-1"));
        assert_eq!(reversal.lines[0].credit_minor, 500);
        assert_eq!(reversal.lines[1].debit_minor, 500);
        assert!(reversal.is_balanced());
        // Original lines untouched.
        assert_eq!(entry.lines[0].debit_minor, 500);
    }

    #[test]
    fn roll_back_requires_posted_status() {
        let mut entry = entry(vec![debit(1, "6100", 500), credit(2, "1000", 500)]);
        let err = entry
            .roll_back(
                "je-2".into(),
                NaiveDate::from_ymd_opt(2025, 10, 20).expect("valid date"),
                "too early",
            )
            .expect_err("proposed entries cannot roll back");
        assert!(matches!(err, InvariantError::InvalidTransition { .. }));
    }

    #[test]
    fn transaction_rejects_zero_amount_and_bad_currency() {
        let mut txn = Transaction {
            txn_id: "txn-1".into(),
            tenant_id: "tenant-1".into(),
            posted_at: NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date"),
            amount_minor: -1245,
            currency: "USD".into(),
            description_raw: "AMZN Mktp US*RT5WQ9".into(),
            counterparty_raw: Some("AMAZON".into()),
            counterparty_norm: None,
            memo: None,
            mcc: None,
            source_file_id: "upload-1".into(),
            source_row_ref: "row:3".into(),
            ingested_at: Utc::now(),
        };
        assert!(txn.validate().is_ok());

        txn.amount_minor = 0;
        assert!(txn.validate().is_err());

        txn.amount_minor = 100;
        txn.currency = "us".into();
        assert!(txn.validate().is_err());
    }

    #[test]
    fn dedupe_key_ignores_upload_identity() {
        let txn = Transaction {
            txn_id: "txn-1".into(),
            tenant_id: "tenant-1".into(),
            posted_at: NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date"),
            amount_minor: -1245,
            currency: "USD".into(),
            description_raw: "AMZN Mktp".into(),
            counterparty_raw: Some("AMAZON".into()),
            counterparty_norm: None,
            memo: None,
            mcc: None,
            source_file_id: "upload-1".into(),
            source_row_ref: "row:3".into(),
            ingested_at: Utc::now(),
        };
        let mut other = txn.clone();
        other.txn_id = "txn-9".into();
        other.source_file_id = "upload-2".into();
        other.source_row_ref = "row:88".into();
        assert_eq!(txn.dedupe_key(), other.dedupe_key());

        other.amount_minor = -1246;
        assert_ne!(txn.dedupe_key(), other.dedupe_key());
    }

    fn batch_mean_variance(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = if values.len() < 2 {
            0.0
        } else {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        };
        (mean, var)
    }

    proptest! {
        #[test]
        fn welford_matches_batch_statistics_under_permutation(
            mut confs in proptest::collection::vec(0.0_f64..=1.0, 2..40),
            seed in 0_u64..1000,
        ) {
            // Deterministic permutation derived from the seed.
            let len = confs.len();
            for i in (1..len).rev() {
                let j = ((seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64)) % (i as u64 + 1)) as usize;
                confs.swap(i, j);
            }

            let mut candidate = RuleCandidate::new(
                "tenant-1".into(),
                "amazon".into(),
                "6100".into(),
            );
            for (i, conf) in confs.iter().enumerate() {
                candidate.observe(EvidenceEvent {
                    txn_id: format!("txn-{i}"),
                    confidence: *conf,
                    source: EvidenceSource::UserOverride,
                    observed_at: Utc::now(),
                });
            }

            let (mean, var) = batch_mean_variance(&confs);
            prop_assert!((candidate.mean_conf - mean).abs() < 1e-9);
            prop_assert!((candidate.variance() - var).abs() < 1e-9);
        }
    }
}
