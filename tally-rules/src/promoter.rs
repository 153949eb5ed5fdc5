use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use uuid::Uuid;

use tally_audit::AppendEvent;
use tally_audit::AuditEventKind;
use tally_audit::AuditSink;
use tally_journal::AccountCode;
use tally_journal::CandidateStatus;
use tally_journal::Clock;
use tally_journal::EvidenceEvent;
use tally_journal::EvidenceSource;
use tally_journal::RuleCandidate;
use tally_journal::RuleDefinition;
use tally_journal::RuleMatchType;
use tally_journal::RuleSource;
use tally_journal::RuleVersion;
use tally_journal::Store;
use tally_journal::TenantId;
use tally_journal::TxnId;

use crate::RulesError;
use crate::RulesResult;
use crate::version_store::RuleVersionStore;

/// Evidence thresholds a candidate must clear before it may be promoted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotionPolicy {
    pub min_obs: u64,
    pub min_conf: f64,
    pub max_var: f64,
    /// Promote on readiness without a human accept step.
    pub auto_accept: bool,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            min_obs: 3,
            min_conf: 0.85,
            max_var: 0.08,
            auto_accept: false,
        }
    }
}

impl PromotionPolicy {
    #[must_use]
    pub fn ready(&self, candidate: &RuleCandidate) -> bool {
        candidate.obs_count >= self.min_obs
            && candidate.mean_conf >= self.min_conf
            && candidate.variance() <= self.max_var
    }
}

type CandidateKey = (TenantId, String, AccountCode);

/// Turns recurring corrections into deterministic rules. Evidence updates
/// for one candidate serialize behind a per-candidate lock; Welford's
/// moments are order-insensitive but not interleaving-safe.
pub struct RulePromoter {
    store: Arc<dyn Store>,
    versions: Arc<RuleVersionStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    policy: PromotionPolicy,
    locks: Mutex<HashMap<CandidateKey, Arc<AsyncMutex<()>>>>,
}

impl RulePromoter {
    pub fn new(
        store: Arc<dyn Store>,
        versions: Arc<RuleVersionStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        policy: PromotionPolicy,
    ) -> Self {
        Self {
            store,
            versions,
            audit,
            clock,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn candidate_lock(&self, key: &CandidateKey) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.clone()).or_default().clone()
    }

    /// Feeds one correction into the candidate's running evidence.
    /// Returns the updated candidate and whether it now clears the
    /// promotion policy.
    pub async fn observe(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        suggested_account: &AccountCode,
        confidence: f64,
        source: EvidenceSource,
        txn_id: &TxnId,
    ) -> RulesResult<(RuleCandidate, bool)> {
        if vendor_norm.trim().is_empty() {
            return Err(RulesError::Validation(
                "cannot aggregate evidence for an empty vendor".into(),
            ));
        }
        let key = (tenant.clone(), vendor_norm.to_owned(), suggested_account.clone());
        let lock = self.candidate_lock(&key);
        let _guard = lock.lock().await;

        let mut candidate = self
            .store
            .rule_candidate(tenant, vendor_norm, suggested_account)
            .await?
            .unwrap_or_else(|| {
                RuleCandidate::new(
                    tenant.clone(),
                    vendor_norm.to_owned(),
                    suggested_account.clone(),
                )
            });
        candidate.observe(EvidenceEvent {
            txn_id: txn_id.clone(),
            confidence,
            source,
            observed_at: self.clock.now(),
        });
        let ready = self.policy.ready(&candidate);
        self.store.put_rule_candidate(candidate.clone()).await?;
        Ok((candidate, ready))
    }

    /// Human accept. With `auto_accept` set, `promote_ready` skips this.
    pub async fn accept(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        suggested_account: &AccountCode,
    ) -> RulesResult<RuleCandidate> {
        self.set_status(tenant, vendor_norm, suggested_account, CandidateStatus::Accepted)
            .await
    }

    pub async fn reject(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        suggested_account: &AccountCode,
    ) -> RulesResult<RuleCandidate> {
        self.set_status(tenant, vendor_norm, suggested_account, CandidateStatus::Rejected)
            .await
    }

    async fn set_status(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        suggested_account: &AccountCode,
        status: CandidateStatus,
    ) -> RulesResult<RuleCandidate> {
        let key = (tenant.clone(), vendor_norm.to_owned(), suggested_account.clone());
        let lock = self.candidate_lock(&key);
        let _guard = lock.lock().await;

        let mut candidate = self
            .store
            .rule_candidate(tenant, vendor_norm, suggested_account)
            .await?
            .ok_or_else(|| {
                RulesError::NotFound(format!("rule candidate {vendor_norm}/{suggested_account}"))
            })?;
        candidate.status = status;
        self.store.put_rule_candidate(candidate.clone()).await?;
        Ok(candidate)
    }

    /// Candidates currently clearing the evidence policy.
    pub async fn ready_candidates(&self, tenant: &TenantId) -> RulesResult<Vec<RuleCandidate>> {
        let mut candidates = self.store.list_rule_candidates(tenant).await?;
        candidates.retain(|candidate| {
            candidate.status == CandidateStatus::Pending && self.policy.ready(candidate)
        });
        Ok(candidates)
    }

    /// Promotes an accepted candidate into a new rule version. An existing
    /// rule for the same pattern is retained for audit; the derived rule
    /// lands one priority above it.
    pub async fn promote(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        suggested_account: &AccountCode,
        author: &str,
    ) -> RulesResult<Arc<RuleVersion>> {
        let candidate = self
            .store
            .rule_candidate(tenant, vendor_norm, suggested_account)
            .await?
            .ok_or_else(|| {
                RulesError::NotFound(format!("rule candidate {vendor_norm}/{suggested_account}"))
            })?;
        match candidate.status {
            CandidateStatus::Accepted => {}
            CandidateStatus::Pending if self.policy.auto_accept => {
                if !self.policy.ready(&candidate) {
                    return Err(RulesError::Validation(format!(
                        "candidate {vendor_norm} has not cleared the evidence policy"
                    )));
                }
            }
            _ => {
                return Err(RulesError::Validation(format!(
                    "candidate {vendor_norm} is not accepted for promotion"
                )));
            }
        }

        let current = self.versions.current(tenant).await?;
        let mut rules = current
            .as_ref()
            .map(|version| version.rules.clone())
            .unwrap_or_default();

        let conflicting_priority = rules
            .iter()
            .filter(|rule| {
                rule.match_type == RuleMatchType::Exact
                    && rule.pattern == vendor_norm
                    && rule.account_code != *suggested_account
            })
            .map(|rule| rule.priority)
            .max();
        let priority = match conflicting_priority {
            Some(existing) => {
                warn!(
                    tenant = tenant.as_str(),
                    vendor = vendor_norm,
                    account = suggested_account.as_str(),
                    existing_priority = existing,
                    "promoted rule shadows a conflicting rule for the same pattern"
                );
                existing + 1
            }
            None => rules.iter().map(|rule| rule.priority).max().unwrap_or(0) + 1,
        };

        let derived = RuleDefinition {
            id: format!("rule-{}", Uuid::new_v4()),
            match_type: RuleMatchType::Exact,
            pattern: vendor_norm.to_owned(),
            account_code: suggested_account.clone(),
            priority,
            author: author.to_owned(),
            source: RuleSource::Promoted,
        };
        rules.push(derived.clone());

        let version = self
            .versions
            .publish(
                tenant,
                rules,
                author,
                &format!("promoted {vendor_norm} -> {suggested_account}"),
            )
            .await?;

        self.audit
            .append(AppendEvent {
                tenant_id: tenant.clone(),
                entity_id: version.version_id.clone(),
                kind: AuditEventKind::RulePromotion,
                actor: author.to_owned(),
                payload: serde_json::json!({
                    "vendor_norm": vendor_norm,
                    "account_code": suggested_account,
                    "rule_id": derived.id,
                    "priority": derived.priority,
                    "obs_count": candidate.obs_count,
                    "mean_conf": candidate.mean_conf,
                    "variance": candidate.variance(),
                    "shadowed_conflict": conflicting_priority.is_some(),
                }),
            })
            .await
            .map_err(|err| RulesError::Audit(err.to_string()))?;

        Ok(version)
    }
}
