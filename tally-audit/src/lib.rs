#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("corrupted chain: {0}")]
    Corrupted(String),
}

/// Closed set of event families the core emits. Payload shapes are typed
/// at the producer; the sink stores them as structured JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    Decision,
    Review,
    RulePromotion,
    RuleRollback,
    Retrain,
    ModelRollback,
    ExportAttempt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEvent {
    pub tenant_id: String,
    pub entity_id: String,
    pub kind: AuditEventKind,
    pub actor: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Consumers deduplicate on this id; delivery is at-least-once.
    pub event_id: String,
    pub tenant_id: String,
    pub entity_id: String,
    pub kind: AuditEventKind,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub previous_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tenant_id: Option<String>,
    pub entity_id: Option<String>,
    pub kind: Option<AuditEventKind>,
    pub limit: Option<usize>,
}

/// Append-only structured event sink. Implementations must not drop
/// events once `append` returns.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AppendEvent) -> AuditResult<AuditRecord>;

    async fn records(&self, filter: AuditFilter) -> AuditResult<Vec<AuditRecord>>;
}

#[derive(Clone, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn append(&self, event: AppendEvent) -> AuditResult<AuditRecord> {
        Ok(AuditRecord {
            event_id: Uuid::new_v4().to_string(),
            tenant_id: event.tenant_id,
            entity_id: event.entity_id,
            kind: event.kind,
            actor: event.actor,
            occurred_at: Utc::now(),
            payload: event.payload,
            previous_hash: String::new(),
            hash: String::new(),
        })
    }

    async fn records(&self, _filter: AuditFilter) -> AuditResult<Vec<AuditRecord>> {
        Ok(Vec::new())
    }
}

/// Hash-chained in-memory sink; each record commits to its predecessor.
#[derive(Default)]
pub struct InMemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn compute_hash(
        previous: &str,
        tenant_id: &str,
        entity_id: &str,
        kind: AuditEventKind,
        occurred_at: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update(tenant_id.as_bytes());
        hasher.update(entity_id.as_bytes());
        hasher.update(format!("{kind:?}").as_bytes());
        let nanos = occurred_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| occurred_at.timestamp_micros() * 1_000);
        hasher.update(nanos.to_be_bytes());
        hasher.update(payload.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn validate(event: &AppendEvent) -> AuditResult<()> {
        if event.tenant_id.trim().is_empty() {
            return Err(AuditError::Validation("tenant_id must be provided".into()));
        }
        if event.entity_id.trim().is_empty() {
            return Err(AuditError::Validation("entity_id must be provided".into()));
        }
        if event.actor.trim().is_empty() {
            return Err(AuditError::Validation("actor must be provided".into()));
        }
        Ok(())
    }

    fn verify_chain(records: &[AuditRecord]) -> AuditResult<()> {
        let mut previous = String::from("genesis");
        for record in records {
            if record.previous_hash != previous {
                return Err(AuditError::Corrupted(format!(
                    "unexpected previous hash for {}",
                    record.event_id
                )));
            }
            let expected = Self::compute_hash(
                &record.previous_hash,
                &record.tenant_id,
                &record.entity_id,
                record.kind,
                record.occurred_at,
                &record.payload,
            );
            if expected != record.hash {
                return Err(AuditError::Corrupted(format!(
                    "hash mismatch for {}",
                    record.event_id
                )));
            }
            previous = record.hash.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: AppendEvent) -> AuditResult<AuditRecord> {
        Self::validate(&event)?;

        let mut guard = self.records.write().await;
        let previous_hash = guard
            .last()
            .map(|record| record.hash.clone())
            .unwrap_or_else(|| "genesis".into());

        let occurred_at = Utc::now();
        let hash = Self::compute_hash(
            &previous_hash,
            &event.tenant_id,
            &event.entity_id,
            event.kind,
            occurred_at,
            &event.payload,
        );
        let record = AuditRecord {
            event_id: Uuid::new_v4().to_string(),
            tenant_id: event.tenant_id,
            entity_id: event.entity_id,
            kind: event.kind,
            actor: event.actor,
            occurred_at,
            payload: event.payload,
            previous_hash,
            hash,
        };
        guard.push(record.clone());
        Ok(record)
    }

    async fn records(&self, filter: AuditFilter) -> AuditResult<Vec<AuditRecord>> {
        let guard = self.records.read().await;
        Self::verify_chain(&guard)?;
        let mut filtered = guard.clone();

        if let Some(tenant_id) = filter.tenant_id {
            filtered.retain(|record| record.tenant_id == tenant_id);
        }
        if let Some(entity_id) = filter.entity_id {
            filtered.retain(|record| record.entity_id == entity_id);
        }
        if let Some(kind) = filter.kind {
            filtered.retain(|record| record.kind == kind);
        }
        if let Some(limit) = filter.limit
            && filtered.len() > limit
        {
            filtered.truncate(limit);
        }

        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event(entity: &str, kind: AuditEventKind) -> AppendEvent {
        AppendEvent {
            tenant_id: "tenant-1".into(),
            entity_id: entity.into(),
            kind,
            actor: "pipeline".into(),
            payload: serde_json::json!({"note": "test"}),
        }
    }

    #[tokio::test]
    async fn appends_records_with_hash_chain() {
        let sink = InMemoryAuditSink::shared();

        let first = sink
            .append(event("je-1", AuditEventKind::Decision))
            .await
            .expect("append");
        assert_eq!(first.previous_hash, "genesis");
        assert!(!first.hash.is_empty());

        let second = sink
            .append(event("je-1", AuditEventKind::ExportAttempt))
            .await
            .expect("append");
        assert_eq!(second.previous_hash, first.hash);

        let records = sink.records(AuditFilter::default()).await.expect("records");
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn filters_by_kind_and_entity() {
        let sink = InMemoryAuditSink::shared();
        sink.append(event("je-1", AuditEventKind::Decision))
            .await
            .expect("append");
        sink.append(event("rules-v2", AuditEventKind::RulePromotion))
            .await
            .expect("append");

        let promotions = sink
            .records(AuditFilter {
                kind: Some(AuditEventKind::RulePromotion),
                ..AuditFilter::default()
            })
            .await
            .expect("records");
        assert_eq!(promotions.len(), 1);
        assert_eq!(promotions[0].entity_id, "rules-v2");
    }

    #[tokio::test]
    async fn detects_tampering() {
        let sink = InMemoryAuditSink::shared();
        sink.append(event("je-1", AuditEventKind::Decision))
            .await
            .expect("append");
        sink.append(event("je-2", AuditEventKind::Decision))
            .await
            .expect("append");

        {
            let mut guard = sink.records.write().await;
            guard[1].previous_hash = "tampered".into();
        }

        let err = sink.records(AuditFilter::default()).await.unwrap_err();
        assert!(matches!(err, AuditError::Corrupted(_)));
    }

    #[tokio::test]
    async fn rejects_blank_identities() {
        let sink = InMemoryAuditSink::shared();
        let mut bad = event("je-1", AuditEventKind::Decision);
        bad.actor = "  ".into();
        assert!(matches!(
            sink.append(bad).await,
            Err(AuditError::Validation(_))
        ));
    }
}
