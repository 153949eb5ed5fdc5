//! Human review queue for gated decisions. Approvals confirm the
//! pipeline's suggestion; corrections re-post under the reviewer's
//! account and feed the rule promoter and embedding memory.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use tally_audit::AppendEvent;
use tally_audit::AuditEventKind;
use tally_audit::AuditSink;
use tally_journal::AccountCode;
use tally_journal::Clock;
use tally_journal::Confirmation;
use tally_journal::EvidenceSource;
use tally_journal::JournalEntryId;
use tally_journal::NotAutoPostReason;
use tally_journal::Store;
use tally_journal::TenantId;
use tally_journal::TraceSignal;
use tally_journal::TxnId;
use tally_memory::EmbeddingMemory;
use tally_rules::RulePromoter;

use crate::PipelineError;
use crate::PipelineResult;
use crate::builder::build_entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Corrected,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub tenant_id: TenantId,
    pub txn_id: TxnId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub je_id: Option<JournalEntryId>,
    pub reason: NotAutoPostReason,
    pub status: ReviewStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_account: Option<AccountCode>,
}

pub struct ReviewDesk {
    store: Arc<dyn Store>,
    promoter: Arc<RulePromoter>,
    memory: Arc<EmbeddingMemory>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    items: RwLock<HashMap<String, ReviewItem>>,
}

impl ReviewDesk {
    pub fn new(
        store: Arc<dyn Store>,
        promoter: Arc<RulePromoter>,
        memory: Arc<EmbeddingMemory>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            promoter,
            memory,
            audit,
            clock,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub async fn enqueue(
        &self,
        tenant: &TenantId,
        txn_id: &TxnId,
        je_id: Option<JournalEntryId>,
        reason: NotAutoPostReason,
    ) -> ReviewItem {
        let item = ReviewItem {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            txn_id: txn_id.clone(),
            je_id,
            reason,
            status: ReviewStatus::Pending,
            enqueued_at: self.clock.now(),
            decided_at: None,
            decided_by: None,
            corrected_account: None,
        };
        let mut items = self.items.write().await;
        items.insert(item.id.clone(), item.clone());
        item
    }

    pub async fn pending(&self, tenant: &TenantId) -> Vec<ReviewItem> {
        let items = self.items.read().await;
        let mut pending: Vec<ReviewItem> = items
            .values()
            .filter(|item| &item.tenant_id == tenant && item.status == ReviewStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        pending
    }

    /// Reviewer agrees with the pipeline: the entry posts as proposed
    /// and the mapping becomes a confirmation.
    pub async fn approve(&self, item_id: &str, reviewer: &str) -> PipelineResult<ReviewItem> {
        let mut item = self.take_pending(item_id).await?;
        let je_id = item
            .je_id
            .clone()
            .ok_or_else(|| PipelineError::Review(format!("item {item_id} has no entry")))?;
        let mut entry = self
            .store
            .journal_entry(&item.tenant_id, &je_id)
            .await?
            .ok_or_else(|| PipelineError::Review(format!("entry {je_id} missing")))?;
        entry.approve()?;
        entry.post()?;
        self.store.put_journal_entry(entry.clone()).await?;

        let txn = self.store.transaction(&item.tenant_id, &item.txn_id).await?;
        if let Some(txn) = txn {
            let vendor_norm = txn
                .counterparty_norm
                .clone()
                .unwrap_or_else(|| {
                    tally_vendor::normalize(
                        txn.counterparty_raw
                            .as_deref()
                            .unwrap_or(&txn.description_raw),
                    )
                });
            let account = category_account(&entry, txn.amount_minor);
            self.record_confirmation(&item.tenant_id, &txn.txn_id, &vendor_norm, &account, &txn)
                .await?;
        }

        item.status = ReviewStatus::Approved;
        item.decided_at = Some(self.clock.now());
        item.decided_by = Some(reviewer.to_owned());
        self.finish(item, "approved").await
    }

    /// Reviewer overrides the account. A fresh, reversal-free entry is
    /// written (the proposed one never posted), and the override feeds
    /// the promoter's evidence stream.
    pub async fn correct(
        &self,
        item_id: &str,
        reviewer: &str,
        corrected_account: &AccountCode,
    ) -> PipelineResult<ReviewItem> {
        let mut item = self.take_pending(item_id).await?;
        let txn = self
            .store
            .transaction(&item.tenant_id, &item.txn_id)
            .await?
            .ok_or_else(|| PipelineError::Review(format!("transaction {} missing", item.txn_id)))?;
        let settings = self
            .store
            .tenant_settings(&item.tenant_id)
            .await?
            .unwrap_or_default();

        let vendor_norm = txn
            .counterparty_norm
            .clone()
            .unwrap_or_else(|| {
                tally_vendor::normalize(
                    txn.counterparty_raw
                        .as_deref()
                        .unwrap_or(&txn.description_raw),
                )
            });

        let mut trace = tally_journal::DecisionTrace {
            vendor_norm: Some(vendor_norm.clone()),
            ..tally_journal::DecisionTrace::default()
        };
        trace.push(TraceSignal::System {
            note: format!("reviewer {reviewer} override"),
        });
        let mut entry = build_entry(
            format!("je-{}", Uuid::new_v4()),
            &txn,
            corrected_account,
            &settings,
            1.0,
            None,
            format!("reviewer override by {reviewer}"),
            trace,
        )?;
        entry.approve()?;
        entry.post()?;
        self.store.put_journal_entry(entry.clone()).await?;

        // The superseded proposal keeps its record; reviewers decided
        // against it, which the item itself documents.
        self.record_confirmation(
            &item.tenant_id,
            &txn.txn_id,
            &vendor_norm,
            corrected_account,
            &txn,
        )
        .await?;
        self.promoter
            .observe(
                &item.tenant_id,
                &vendor_norm,
                corrected_account,
                1.0,
                EvidenceSource::UserOverride,
                &txn.txn_id,
            )
            .await?;

        item.status = ReviewStatus::Corrected;
        item.decided_at = Some(self.clock.now());
        item.decided_by = Some(reviewer.to_owned());
        item.corrected_account = Some(corrected_account.clone());
        item.je_id = Some(entry.je_id);
        self.finish(item, "corrected").await
    }

    /// Reviewer rejects the proposal outright; the entry stays proposed
    /// and nothing is learned from it.
    pub async fn reject(&self, item_id: &str, reviewer: &str) -> PipelineResult<ReviewItem> {
        let mut item = self.take_pending(item_id).await?;
        item.status = ReviewStatus::Rejected;
        item.decided_at = Some(self.clock.now());
        item.decided_by = Some(reviewer.to_owned());
        self.finish(item, "rejected").await
    }

    async fn take_pending(&self, item_id: &str) -> PipelineResult<ReviewItem> {
        let items = self.items.read().await;
        let item = items
            .get(item_id)
            .ok_or_else(|| PipelineError::Review(format!("no review item {item_id}")))?;
        if item.status != ReviewStatus::Pending {
            return Err(PipelineError::Review(format!(
                "review item {item_id} already decided"
            )));
        }
        Ok(item.clone())
    }

    async fn finish(&self, item: ReviewItem, action: &str) -> PipelineResult<ReviewItem> {
        self.audit
            .append(AppendEvent {
                tenant_id: item.tenant_id.clone(),
                entity_id: item
                    .je_id
                    .clone()
                    .unwrap_or_else(|| item.txn_id.clone()),
                kind: AuditEventKind::Review,
                actor: item.decided_by.clone().unwrap_or_else(|| "reviewer".into()),
                payload: serde_json::json!({
                    "item_id": item.id,
                    "action": action,
                    "reason": item.reason,
                    "corrected_account": item.corrected_account,
                }),
            })
            .await
            .map_err(|err| PipelineError::Audit(err.to_string()))?;
        let mut items = self.items.write().await;
        items.insert(item.id.clone(), item.clone());
        Ok(item)
    }

    async fn record_confirmation(
        &self,
        tenant: &TenantId,
        txn_id: &TxnId,
        vendor_norm: &str,
        account: &AccountCode,
        txn: &tally_journal::Transaction,
    ) -> PipelineResult<()> {
        self.store
            .append_confirmation(Confirmation {
                tenant_id: tenant.clone(),
                vendor_norm: vendor_norm.to_owned(),
                account_code: account.clone(),
                txn_id: txn_id.clone(),
                confirmed_at: self.clock.now(),
            })
            .await?;
        let description_norm = tally_vendor::normalize(&txn.description_raw);
        self.memory
            .record_confirmed(tenant, vendor_norm, account, &description_norm)
            .await?;
        Ok(())
    }
}

fn category_account(entry: &tally_journal::JournalEntry, amount_minor: i64) -> AccountCode {
    // Outflows carry the category on the debit line, inflows on the
    // credit line.
    let line = if amount_minor < 0 {
        entry.lines.first()
    } else {
        entry.lines.get(1)
    };
    line.map(|line| line.account_code.clone()).unwrap_or_default()
}
