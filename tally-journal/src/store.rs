use std::collections::HashSet;

use async_trait::async_trait;

use crate::Account;
use crate::AccountCode;
use crate::CalibrationModel;
use crate::Confirmation;
use crate::EmbeddingMemoryRecord;
use crate::ExportRecord;
use crate::JournalEntry;
use crate::JournalEntryId;
use crate::ModelVersionId;
use crate::RetrainEvent;
use crate::RuleCandidate;
use crate::RuleVersion;
use crate::RuleVersionId;
use crate::StorageError;
use crate::TenantId;
use crate::TenantSettings;
use crate::Transaction;
use crate::TxnId;

pub type StoreResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalInsert {
    Inserted,
    Duplicate,
}

/// Persistent entity CRUD required by the core. Implementations must make
/// `insert_export_record_if_absent` and `compare_and_swap_pointer` atomic;
/// everything else is plain keyed access.
#[async_trait]
pub trait Store: Send + Sync {
    // Transactions — created by ingestion, immutable afterwards.
    async fn insert_transaction(&self, txn: Transaction) -> StoreResult<()>;
    async fn transaction(&self, tenant: &TenantId, txn_id: &TxnId)
    -> StoreResult<Option<Transaction>>;
    async fn list_transactions(&self, tenant: &TenantId) -> StoreResult<Vec<Transaction>>;
    async fn known_dedupe_keys(&self, tenant: &TenantId) -> StoreResult<HashSet<String>>;

    // Chart of accounts.
    async fn upsert_account(&self, account: Account) -> StoreResult<()>;
    async fn account(&self, tenant: &TenantId, code: &AccountCode) -> StoreResult<Option<Account>>;
    async fn list_accounts(&self, tenant: &TenantId) -> StoreResult<Vec<Account>>;

    // Journal entries.
    async fn put_journal_entry(&self, entry: JournalEntry) -> StoreResult<()>;
    async fn journal_entry(
        &self,
        tenant: &TenantId,
        je_id: &JournalEntryId,
    ) -> StoreResult<Option<JournalEntry>>;
    async fn list_journal_entries(&self, tenant: &TenantId) -> StoreResult<Vec<JournalEntry>>;
    /// Posted line amounts for one account, newest last; feeds the
    /// anomaly band.
    async fn posted_amounts_for_account(
        &self,
        tenant: &TenantId,
        code: &AccountCode,
    ) -> StoreResult<Vec<i64>>;

    // Confirmed vendor -> account labels.
    async fn append_confirmation(&self, confirmation: Confirmation) -> StoreResult<()>;
    /// Most recent confirmations for a vendor, newest first.
    async fn recent_confirmations(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        limit: usize,
    ) -> StoreResult<Vec<Confirmation>>;

    // Export idempotency ledger, unique on (tenant, target, external_id).
    async fn insert_export_record_if_absent(
        &self,
        record: ExportRecord,
    ) -> StoreResult<ConditionalInsert>;
    async fn export_record(
        &self,
        tenant: &TenantId,
        target: &str,
        external_id: &str,
    ) -> StoreResult<Option<ExportRecord>>;
    async fn update_export_record(&self, record: ExportRecord) -> StoreResult<()>;

    // Rule candidates keyed by (tenant, vendor_norm, suggested_account).
    async fn rule_candidate(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        account: &AccountCode,
    ) -> StoreResult<Option<RuleCandidate>>;
    async fn put_rule_candidate(&self, candidate: RuleCandidate) -> StoreResult<()>;
    async fn list_rule_candidates(&self, tenant: &TenantId) -> StoreResult<Vec<RuleCandidate>>;

    // Rule versions are write-once.
    async fn put_rule_version(&self, version: RuleVersion) -> StoreResult<()>;
    async fn rule_version(
        &self,
        tenant: &TenantId,
        version_id: &RuleVersionId,
    ) -> StoreResult<Option<RuleVersion>>;
    async fn list_rule_versions(&self, tenant: &TenantId) -> StoreResult<Vec<RuleVersion>>;

    // Calibration models, bound to classifier versions.
    async fn put_calibration_model(
        &self,
        tenant: &TenantId,
        model: CalibrationModel,
    ) -> StoreResult<()>;
    async fn calibration_model(
        &self,
        tenant: &TenantId,
        model_version_id: &ModelVersionId,
    ) -> StoreResult<Option<CalibrationModel>>;

    // Embedding memory records.
    async fn append_embedding_record(&self, record: EmbeddingMemoryRecord) -> StoreResult<()>;
    async fn embedding_records(&self, tenant: &TenantId)
    -> StoreResult<Vec<EmbeddingMemoryRecord>>;

    // Retrain history.
    async fn append_retrain_event(&self, event: RetrainEvent) -> StoreResult<()>;
    async fn list_retrain_events(&self, tenant: &TenantId) -> StoreResult<Vec<RetrainEvent>>;

    // Tenant settings.
    async fn tenant_settings(&self, tenant: &TenantId) -> StoreResult<Option<TenantSettings>>;
    async fn put_tenant_settings(
        &self,
        tenant: &TenantId,
        settings: TenantSettings,
    ) -> StoreResult<()>;

    // Versioned pointers (current rule version, current model). Readers
    // observe either the old or the new value, never a partial state.
    async fn current_pointer(&self, tenant: &TenantId, name: &str) -> StoreResult<Option<String>>;
    /// Returns `false` when the expectation no longer holds (lost race);
    /// callers retry once and then surface a `ConcurrencyError`.
    async fn compare_and_swap_pointer(
        &self,
        tenant: &TenantId,
        name: &str,
        expected: Option<&str>,
        new: &str,
    ) -> StoreResult<bool>;
}

/// Content-addressed artifact storage for model blobs and rule-version
/// serializations.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes and returns their SHA-256 content hash.
    async fn put(&self, bytes: Vec<u8>) -> StoreResult<String>;
    async fn get(&self, content_hash: &str) -> StoreResult<Option<Vec<u8>>>;
}
