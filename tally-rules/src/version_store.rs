use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use tracing::info;

use tally_journal::BlobStore;
use tally_journal::Clock;
use tally_journal::ConcurrencyError;
use tally_journal::RuleDefinition;
use tally_journal::RuleVersion;
use tally_journal::RuleVersionId;
use tally_journal::Store;
use tally_journal::TenantId;

use crate::RulesError;
use crate::RulesResult;

/// Store pointer under which the active rule version id is published.
pub const RULES_POINTER: &str = "rules.current";

/// Versioned rule storage. Versions are write-once and content-addressed;
/// the active version is a pointer readers resolve through a snapshot
/// cache, so a publish is observed as a whole or not at all.
pub struct RuleVersionStore {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<TenantId, Arc<RuleVersion>>>,
}

impl RuleVersionStore {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            blobs,
            clock,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Active rule version for a tenant, or `None` before the first
    /// publish.
    pub async fn current(&self, tenant: &TenantId) -> RulesResult<Option<Arc<RuleVersion>>> {
        let Some(version_id) = self.store.current_pointer(tenant, RULES_POINTER).await? else {
            return Ok(None);
        };
        if let Ok(cache) = self.cache.read()
            && let Some(cached) = cache.get(tenant)
            && cached.version_id == version_id
        {
            return Ok(Some(cached.clone()));
        }
        let version = self
            .store
            .rule_version(tenant, &version_id)
            .await?
            .ok_or_else(|| RulesError::NotFound(format!("rule version {version_id}")))?;
        let shared = Arc::new(version);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(tenant.clone(), shared.clone());
        }
        Ok(Some(shared))
    }

    /// Monotone lexical version id; strictly greater than `current`.
    fn next_version_id(&self, current: Option<&RuleVersionId>) -> RuleVersionId {
        let stamp = format!("v-{:014}", self.clock.now().timestamp_millis());
        match current {
            Some(current_id) if stamp.as_str() <= current_id.as_str() => {
                // Same-millisecond publish; extend the lexical tail.
                format!("{current_id}-1")
            }
            _ => stamp,
        }
    }

    /// Builds and publishes a new immutable version holding `rules`. The
    /// current pointer is swapped atomically; a lost race is retried once
    /// against the fresh pointer before surfacing.
    pub async fn publish(
        &self,
        tenant: &TenantId,
        rules: Vec<RuleDefinition>,
        author: &str,
        notes: &str,
    ) -> RulesResult<Arc<RuleVersion>> {
        let mut expected = self.store.current_pointer(tenant, RULES_POINTER).await?;
        let mut last_issued: Option<RuleVersionId> = None;
        for attempt in 0..2 {
            // The id must lexically exceed both the pointer we expect to
            // replace and anything this call already wrote.
            let floor = match (&expected, &last_issued) {
                (Some(a), Some(b)) => Some(a.max(b).clone()),
                (Some(a), None) => Some(a.clone()),
                (None, b) => b.clone(),
            };
            let version = RuleVersion {
                version_id: self.next_version_id(floor.as_ref()),
                tenant_id: tenant.clone(),
                rules: rules.clone(),
                created_at: self.clock.now(),
                author: author.to_owned(),
                notes: notes.to_owned(),
                parent_version_id: expected.clone(),
            };
            let serialized = serde_json::to_vec(&version)
                .map_err(|err| RulesError::Validation(format!("unserializable version: {err}")))?;
            let content_hash = self.blobs.put(serialized).await?;
            self.store.put_rule_version(version.clone()).await?;

            let swapped = self
                .store
                .compare_and_swap_pointer(
                    tenant,
                    RULES_POINTER,
                    expected.as_deref(),
                    &version.version_id,
                )
                .await?;
            if swapped {
                info!(
                    tenant = tenant.as_str(),
                    version = version.version_id.as_str(),
                    content_hash = content_hash.as_str(),
                    rules = version.rules.len(),
                    "published rule version"
                );
                let shared = Arc::new(version);
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(tenant.clone(), shared.clone());
                }
                return Ok(shared);
            }
            if attempt == 0 {
                last_issued = Some(version.version_id);
                expected = self.store.current_pointer(tenant, RULES_POINTER).await?;
            }
        }
        Err(ConcurrencyError {
            pointer: format!("{tenant}/{RULES_POINTER}"),
            expected,
        }
        .into())
    }

    /// Rolls the tenant back to `target_version_id` by publishing a new
    /// version whose rules equal the target's. Lineage stays intact: the
    /// new version's parent is the version being abandoned.
    pub async fn rollback(
        &self,
        tenant: &TenantId,
        target_version_id: &RuleVersionId,
        author: &str,
    ) -> RulesResult<Arc<RuleVersion>> {
        let target = self
            .store
            .rule_version(tenant, target_version_id)
            .await?
            .ok_or_else(|| RulesError::NotFound(format!("rule version {target_version_id}")))?;
        self.publish(
            tenant,
            target.rules,
            author,
            &format!("rollback to {target_version_id}"),
        )
        .await
    }

    pub async fn version(
        &self,
        tenant: &TenantId,
        version_id: &RuleVersionId,
    ) -> RulesResult<RuleVersion> {
        self.store
            .rule_version(tenant, version_id)
            .await?
            .ok_or_else(|| RulesError::NotFound(format!("rule version {version_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tally_journal::InMemoryBlobStore;
    use tally_journal::InMemoryStore;
    use tally_journal::ManualClock;
    use tally_journal::RuleMatchType;
    use tally_journal::RuleSource;

    fn clock() -> Arc<ManualClock> {
        let start = chrono::DateTime::parse_from_rfc3339("2025-10-20T00:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&chrono::Utc);
        Arc::new(ManualClock::at(start))
    }

    fn rule(pattern: &str, account: &str) -> RuleDefinition {
        RuleDefinition {
            id: format!("rule-{pattern}"),
            match_type: RuleMatchType::Exact,
            pattern: pattern.into(),
            account_code: account.into(),
            priority: 10,
            author: "ops".into(),
            source: RuleSource::Human,
        }
    }

    fn store() -> (RuleVersionStore, Arc<ManualClock>) {
        let clock = clock();
        (
            RuleVersionStore::new(
                Arc::new(InMemoryStore::new()),
                Arc::new(InMemoryBlobStore::new()),
                clock.clone(),
            ),
            clock,
        )
    }

    #[tokio::test]
    async fn publish_sets_current_and_links_parent() {
        let (versions, clock) = store();
        let tenant: TenantId = "tenant-1".into();

        assert!(versions.current(&tenant).await.expect("current").is_none());

        let v1 = versions
            .publish(&tenant, vec![rule("amazon", "6100")], "ops", "initial")
            .await
            .expect("publish");
        assert!(v1.parent_version_id.is_none());

        clock.advance(std::time::Duration::from_secs(1));
        let v2 = versions
            .publish(
                &tenant,
                vec![rule("amazon", "6100"), rule("uber", "6300")],
                "ops",
                "add uber",
            )
            .await
            .expect("publish");
        assert_eq!(v2.parent_version_id.as_ref(), Some(&v1.version_id));
        assert!(v2.version_id > v1.version_id);

        let current = versions
            .current(&tenant)
            .await
            .expect("current")
            .expect("version exists");
        assert_eq!(current.version_id, v2.version_id);
        assert_eq!(current.rules.len(), 2);
    }

    #[tokio::test]
    async fn version_ids_stay_monotone_within_one_millisecond() {
        let (versions, _clock) = store();
        let tenant: TenantId = "tenant-1".into();
        let v1 = versions
            .publish(&tenant, vec![], "ops", "a")
            .await
            .expect("publish");
        let v2 = versions
            .publish(&tenant, vec![], "ops", "b")
            .await
            .expect("publish");
        let v3 = versions
            .publish(&tenant, vec![], "ops", "c")
            .await
            .expect("publish");
        assert!(v1.version_id < v2.version_id);
        assert!(v2.version_id < v3.version_id);
    }

    #[tokio::test]
    async fn rollback_restores_target_rules_under_new_id() {
        let (versions, clock) = store();
        let tenant: TenantId = "tenant-1".into();

        let v1 = versions
            .publish(&tenant, vec![rule("amazon", "6100")], "ops", "initial")
            .await
            .expect("publish");
        clock.advance(std::time::Duration::from_secs(1));
        let v2 = versions
            .publish(&tenant, vec![rule("amazon", "6900")], "ops", "misguided")
            .await
            .expect("publish");
        clock.advance(std::time::Duration::from_secs(1));

        let restored = versions
            .rollback(&tenant, &v1.version_id, "ops")
            .await
            .expect("rollback");
        assert_eq!(restored.rules, v1.rules);
        assert_eq!(restored.parent_version_id.as_ref(), Some(&v2.version_id));
        assert!(restored.notes.contains(&v1.version_id));

        let current = versions
            .current(&tenant)
            .await
            .expect("current")
            .expect("version exists");
        assert_eq!(current.version_id, restored.version_id);
    }

    #[tokio::test]
    async fn stale_cache_is_refreshed_after_external_swap() {
        let inner = Arc::new(InMemoryStore::new());
        let clock = clock();
        let versions = RuleVersionStore::new(
            inner.clone(),
            Arc::new(InMemoryBlobStore::new()),
            clock.clone(),
        );
        let tenant: TenantId = "tenant-1".into();
        let v1 = versions
            .publish(&tenant, vec![rule("amazon", "6100")], "ops", "initial")
            .await
            .expect("publish");

        // Another process publishes through the same backing store.
        clock.advance(std::time::Duration::from_secs(2));
        let other = RuleVersionStore::new(
            inner.clone(),
            Arc::new(InMemoryBlobStore::new()),
            clock.clone(),
        );
        let v2 = other
            .publish(&tenant, vec![rule("uber", "6300")], "ops", "external")
            .await
            .expect("publish");
        assert!(v2.version_id > v1.version_id);

        let seen = versions
            .current(&tenant)
            .await
            .expect("current")
            .expect("version exists");
        assert_eq!(seen.version_id, v2.version_id);
    }
}
