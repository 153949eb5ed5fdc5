use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::Account;
use crate::AccountCode;
use crate::CalibrationModel;
use crate::Confirmation;
use crate::EmbeddingMemoryRecord;
use crate::EntryStatus;
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
use crate::store::BlobStore;
use crate::store::ConditionalInsert;
use crate::store::Store;
use crate::store::StoreResult;

#[derive(Default)]
struct StoreState {
    transactions: HashMap<(TenantId, TxnId), Transaction>,
    accounts: HashMap<(TenantId, AccountCode), Account>,
    entries: HashMap<(TenantId, JournalEntryId), JournalEntry>,
    confirmations: Vec<Confirmation>,
    export_records: HashMap<(TenantId, String, String), ExportRecord>,
    rule_candidates: HashMap<(TenantId, String, AccountCode), RuleCandidate>,
    rule_versions: HashMap<(TenantId, RuleVersionId), RuleVersion>,
    calibration_models: HashMap<(TenantId, ModelVersionId), CalibrationModel>,
    embedding_records: Vec<EmbeddingMemoryRecord>,
    retrain_events: Vec<RetrainEvent>,
    settings: HashMap<TenantId, TenantSettings>,
    pointers: HashMap<(TenantId, String), String>,
}

/// Reference `Store` used by tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_transaction(&self, txn: Transaction) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let key = (txn.tenant_id.clone(), txn.txn_id.clone());
        if state.transactions.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "transaction {} already exists",
                key.1
            )));
        }
        state.transactions.insert(key, txn);
        Ok(())
    }

    async fn transaction(
        &self,
        tenant: &TenantId,
        txn_id: &TxnId,
    ) -> StoreResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .get(&(tenant.clone(), txn_id.clone()))
            .cloned())
    }

    async fn list_transactions(&self, tenant: &TenantId) -> StoreResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut transactions: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|txn| &txn.tenant_id == tenant)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| {
            (a.posted_at, &a.txn_id).cmp(&(b.posted_at, &b.txn_id))
        });
        Ok(transactions)
    }

    async fn known_dedupe_keys(&self, tenant: &TenantId) -> StoreResult<HashSet<String>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .filter(|txn| &txn.tenant_id == tenant)
            .map(Transaction::dedupe_key)
            .collect())
    }

    async fn upsert_account(&self, account: Account) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .accounts
            .insert((account.tenant_id.clone(), account.code.clone()), account);
        Ok(())
    }

    async fn account(&self, tenant: &TenantId, code: &AccountCode) -> StoreResult<Option<Account>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(&(tenant.clone(), code.clone())).cloned())
    }

    async fn list_accounts(&self, tenant: &TenantId) -> StoreResult<Vec<Account>> {
        let state = self.state.read().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|account| &account.tenant_id == tenant)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(accounts)
    }

    async fn put_journal_entry(&self, entry: JournalEntry) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .entries
            .insert((entry.tenant_id.clone(), entry.je_id.clone()), entry);
        Ok(())
    }

    async fn journal_entry(
        &self,
        tenant: &TenantId,
        je_id: &JournalEntryId,
    ) -> StoreResult<Option<JournalEntry>> {
        let state = self.state.read().await;
        Ok(state.entries.get(&(tenant.clone(), je_id.clone())).cloned())
    }

    async fn list_journal_entries(&self, tenant: &TenantId) -> StoreResult<Vec<JournalEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<JournalEntry> = state
            .entries
            .values()
            .filter(|entry| &entry.tenant_id == tenant)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            (a.posted_at, &a.je_id).cmp(&(b.posted_at, &b.je_id))
        });
        Ok(entries)
    }

    async fn posted_amounts_for_account(
        &self,
        tenant: &TenantId,
        code: &AccountCode,
    ) -> StoreResult<Vec<i64>> {
        let state = self.state.read().await;
        let mut posted: Vec<(chrono::NaiveDate, JournalEntryId, i64)> = Vec::new();
        for entry in state.entries.values() {
            if &entry.tenant_id != tenant || entry.status != EntryStatus::Posted {
                continue;
            }
            for line in &entry.lines {
                if &line.account_code == code {
                    posted.push((
                        entry.posted_at,
                        entry.je_id.clone(),
                        line.debit_minor.max(line.credit_minor),
                    ));
                }
            }
        }
        posted.sort();
        Ok(posted.into_iter().map(|(_, _, amount)| amount).collect())
    }

    async fn append_confirmation(&self, confirmation: Confirmation) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.confirmations.push(confirmation);
        Ok(())
    }

    async fn recent_confirmations(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        limit: usize,
    ) -> StoreResult<Vec<Confirmation>> {
        let state = self.state.read().await;
        let mut matching: Vec<Confirmation> = state
            .confirmations
            .iter()
            .filter(|c| &c.tenant_id == tenant && c.vendor_norm == vendor_norm)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.confirmed_at.cmp(&a.confirmed_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn insert_export_record_if_absent(
        &self,
        record: ExportRecord,
    ) -> StoreResult<ConditionalInsert> {
        let mut state = self.state.write().await;
        let key = (
            record.tenant_id.clone(),
            record.target.clone(),
            record.external_id.clone(),
        );
        if state.export_records.contains_key(&key) {
            return Ok(ConditionalInsert::Duplicate);
        }
        state.export_records.insert(key, record);
        Ok(ConditionalInsert::Inserted)
    }

    async fn export_record(
        &self,
        tenant: &TenantId,
        target: &str,
        external_id: &str,
    ) -> StoreResult<Option<ExportRecord>> {
        let state = self.state.read().await;
        Ok(state
            .export_records
            .get(&(tenant.clone(), target.to_owned(), external_id.to_owned()))
            .cloned())
    }

    async fn update_export_record(&self, record: ExportRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let key = (
            record.tenant_id.clone(),
            record.target.clone(),
            record.external_id.clone(),
        );
        if !state.export_records.contains_key(&key) {
            return Err(StorageError::NotFound(format!(
                "export record {} missing",
                key.2
            )));
        }
        state.export_records.insert(key, record);
        Ok(())
    }

    async fn rule_candidate(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        account: &AccountCode,
    ) -> StoreResult<Option<RuleCandidate>> {
        let state = self.state.read().await;
        Ok(state
            .rule_candidates
            .get(&(tenant.clone(), vendor_norm.to_owned(), account.clone()))
            .cloned())
    }

    async fn put_rule_candidate(&self, candidate: RuleCandidate) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.rule_candidates.insert(
            (
                candidate.tenant_id.clone(),
                candidate.vendor_norm.clone(),
                candidate.suggested_account.clone(),
            ),
            candidate,
        );
        Ok(())
    }

    async fn list_rule_candidates(&self, tenant: &TenantId) -> StoreResult<Vec<RuleCandidate>> {
        let state = self.state.read().await;
        let mut candidates: Vec<RuleCandidate> = state
            .rule_candidates
            .values()
            .filter(|candidate| &candidate.tenant_id == tenant)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            (&a.vendor_norm, &a.suggested_account).cmp(&(&b.vendor_norm, &b.suggested_account))
        });
        Ok(candidates)
    }

    async fn put_rule_version(&self, version: RuleVersion) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let key = (version.tenant_id.clone(), version.version_id.clone());
        if state.rule_versions.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "rule version {} is immutable",
                key.1
            )));
        }
        state.rule_versions.insert(key, version);
        Ok(())
    }

    async fn rule_version(
        &self,
        tenant: &TenantId,
        version_id: &RuleVersionId,
    ) -> StoreResult<Option<RuleVersion>> {
        let state = self.state.read().await;
        Ok(state
            .rule_versions
            .get(&(tenant.clone(), version_id.clone()))
            .cloned())
    }

    async fn list_rule_versions(&self, tenant: &TenantId) -> StoreResult<Vec<RuleVersion>> {
        let state = self.state.read().await;
        let mut versions: Vec<RuleVersion> = state
            .rule_versions
            .values()
            .filter(|version| &version.tenant_id == tenant)
            .cloned()
            .collect();
        versions.sort_by(|a, b| a.version_id.cmp(&b.version_id));
        Ok(versions)
    }

    async fn put_calibration_model(
        &self,
        tenant: &TenantId,
        model: CalibrationModel,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .calibration_models
            .insert((tenant.clone(), model.model_version_id.clone()), model);
        Ok(())
    }

    async fn calibration_model(
        &self,
        tenant: &TenantId,
        model_version_id: &ModelVersionId,
    ) -> StoreResult<Option<CalibrationModel>> {
        let state = self.state.read().await;
        Ok(state
            .calibration_models
            .get(&(tenant.clone(), model_version_id.clone()))
            .cloned())
    }

    async fn append_embedding_record(&self, record: EmbeddingMemoryRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.embedding_records.push(record);
        Ok(())
    }

    async fn embedding_records(
        &self,
        tenant: &TenantId,
    ) -> StoreResult<Vec<EmbeddingMemoryRecord>> {
        let state = self.state.read().await;
        Ok(state
            .embedding_records
            .iter()
            .filter(|record| &record.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn append_retrain_event(&self, event: RetrainEvent) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.retrain_events.push(event);
        Ok(())
    }

    async fn list_retrain_events(&self, tenant: &TenantId) -> StoreResult<Vec<RetrainEvent>> {
        let state = self.state.read().await;
        Ok(state
            .retrain_events
            .iter()
            .filter(|event| &event.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn tenant_settings(&self, tenant: &TenantId) -> StoreResult<Option<TenantSettings>> {
        let state = self.state.read().await;
        Ok(state.settings.get(tenant).cloned())
    }

    async fn put_tenant_settings(
        &self,
        tenant: &TenantId,
        settings: TenantSettings,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.settings.insert(tenant.clone(), settings);
        Ok(())
    }

    async fn current_pointer(&self, tenant: &TenantId, name: &str) -> StoreResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state.pointers.get(&(tenant.clone(), name.to_owned())).cloned())
    }

    async fn compare_and_swap_pointer(
        &self,
        tenant: &TenantId,
        name: &str,
        expected: Option<&str>,
        new: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let key = (tenant.clone(), name.to_owned());
        let current = state.pointers.get(&key).map(String::as_str);
        if current != expected {
            return Ok(false);
        }
        state.pointers.insert(key, new.to_owned());
        Ok(true)
    }
}

/// Content-addressed in-memory blob store.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> StoreResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = format!("{:x}", hasher.finalize());
        let mut blobs = self.blobs.write().await;
        blobs.insert(hash.clone(), bytes);
        Ok(hash)
    }

    async fn get(&self, content_hash: &str) -> StoreResult<Option<Vec<u8>>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(content_hash).cloned())
    }
}
