#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Vector similarity over historical vendor -> account mappings. Only
//! confirmed records vote; an unavailable embedding backend degrades the
//! signal to zero instead of erroring out of the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use tally_journal::AccountCode;
use tally_journal::Clock;
use tally_journal::EmbeddingMemoryRecord;
use tally_journal::StorageError;
use tally_journal::Store;
use tally_journal::TenantId;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Embedding backend seam. `embed` returning `Err` means "unavailable";
/// the caller treats that as a degraded signal, never a failure.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryConfig {
    pub top_k: usize,
    /// Retrieval returns score 0 when the best similarity sits below this.
    pub sim_floor: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            sim_floor: 0.75,
        }
    }
}

/// Retrieval outcome fed to the blender.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySignal {
    pub account_code: Option<AccountCode>,
    pub score: f64,
    /// Set when the signal degraded (backend down, empty memory, floor).
    pub degraded: Option<String>,
}

impl MemorySignal {
    fn zero(reason: &str) -> Self {
        Self {
            account_code: None,
            score: 0.0,
            degraded: Some(reason.to_owned()),
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Text embedded for a transaction: normalized description joined with
/// the normalized counterparty.
#[must_use]
pub fn memory_text(description_norm: &str, counterparty_norm: &str) -> String {
    match (description_norm.is_empty(), counterparty_norm.is_empty()) {
        (false, false) => format!("{description_norm} {counterparty_norm}"),
        (false, true) => description_norm.to_owned(),
        (true, _) => counterparty_norm.to_owned(),
    }
}

pub struct EmbeddingMemory {
    store: Arc<dyn Store>,
    client: Arc<dyn EmbeddingClient>,
    clock: Arc<dyn Clock>,
    config: MemoryConfig,
}

impl EmbeddingMemory {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn EmbeddingClient>,
        clock: Arc<dyn Clock>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            config,
        }
    }

    /// Stores a confirmed mapping. A backend outage is logged and
    /// swallowed: memory writes are best-effort enrichment.
    pub async fn record_confirmed(
        &self,
        tenant: &TenantId,
        vendor_norm: &str,
        account_code: &AccountCode,
        description_norm: &str,
    ) -> Result<(), MemoryError> {
        let text = memory_text(description_norm, vendor_norm);
        let embedding = match self.client.embed(&text).await {
            Ok(embedding) => embedding,
            Err(reason) => {
                warn!(vendor = vendor_norm, %reason, "embedding write skipped");
                return Ok(());
            }
        };
        self.store
            .append_embedding_record(EmbeddingMemoryRecord {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant.clone(),
                vendor_norm: vendor_norm.to_owned(),
                account_code: account_code.clone(),
                embedding,
                confirmed: true,
                created_at: self.clock.now(),
            })
            .await?;
        Ok(())
    }

    /// Cosine top-k retrieval with a similarity floor and a
    /// similarity-weighted vote across the neighbors.
    pub async fn retrieve(
        &self,
        tenant: &TenantId,
        description_norm: &str,
        counterparty_norm: &str,
    ) -> Result<MemorySignal, MemoryError> {
        let text = memory_text(description_norm, counterparty_norm);
        if text.is_empty() {
            return Ok(MemorySignal::zero("empty_query"));
        }
        let query = match self.client.embed(&text).await {
            Ok(query) => query,
            Err(reason) => {
                warn!(%reason, "embedding retrieval degraded");
                return Ok(MemorySignal::zero("embedding_unavailable"));
            }
        };

        let records = self.store.embedding_records(tenant).await?;
        let mut scored: Vec<(f64, &EmbeddingMemoryRecord)> = records
            .iter()
            .filter(|record| record.confirmed)
            .map(|record| (cosine(&query, &record.embedding), record))
            .collect();
        if scored.is_empty() {
            return Ok(MemorySignal::zero("empty_memory"));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.config.top_k);

        let top_similarity = scored[0].0;
        if top_similarity < self.config.sim_floor {
            debug!(top_similarity, "memory below similarity floor");
            return Ok(MemorySignal::zero("below_sim_floor"));
        }

        let mut votes: HashMap<&AccountCode, f64> = HashMap::new();
        let mut total = 0.0_f64;
        for (similarity, record) in &scored {
            let weight = similarity.max(0.0);
            *votes.entry(&record.account_code).or_insert(0.0) += weight;
            total += weight;
        }
        // Deterministic winner: strongest vote, lowest code on ties.
        let best = votes
            .into_iter()
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)));
        match best {
            Some((account, vote)) if total > 0.0 => Ok(MemorySignal {
                account_code: Some(account.clone()),
                score: (vote / total).clamp(0.0, 1.0),
                degraded: None,
            }),
            _ => Ok(MemorySignal::zero("no_votes")),
        }
    }
}
