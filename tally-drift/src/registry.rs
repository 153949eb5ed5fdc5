//! Model artifact registry. The serving classifier is a pointer to a
//! content-addressed blob; promotion is a pointer flip with a backup
//! pointer left behind for rollback.

use std::sync::Arc;

use tracing::info;

use tally_classifier::AccountClassifier;
use tally_journal::BlobStore;
use tally_journal::CalibrationModel;
use tally_journal::Clock;
use tally_journal::Store;
use tally_journal::TenantId;

use crate::DriftError;
use crate::DriftResult;

/// Pointer under which the serving model's blob hash is published.
pub const MODEL_POINTER: &str = "model.current";

pub struct ModelRegistry {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            blobs,
            clock,
        }
    }

    /// Serving classifier and its calibration, or `None` before the first
    /// promotion. A classifier whose calibration is missing is returned
    /// with `None` calibration; the pipeline must refuse to auto-post in
    /// that state.
    pub async fn current(
        &self,
        tenant: &TenantId,
    ) -> DriftResult<Option<(AccountClassifier, Option<CalibrationModel>)>> {
        let Some(blob_hash) = self.store.current_pointer(tenant, MODEL_POINTER).await? else {
            return Ok(None);
        };
        let bytes = self
            .blobs
            .get(&blob_hash)
            .await?
            .ok_or_else(|| DriftError::Validation(format!("model blob {blob_hash} missing")))?;
        let classifier = AccountClassifier::from_artifact(&bytes)
            .map_err(|err| DriftError::Validation(err.to_string()))?;
        let calibration = self
            .store
            .calibration_model(tenant, &classifier.model_version_id)
            .await?;
        Ok(Some((classifier, calibration)))
    }

    /// Atomically swaps the serving model to `candidate`, leaving a
    /// `model_backup_<ts>` pointer at the prior artifact. Returns the
    /// backup pointer name, if there was a prior model.
    pub async fn promote(
        &self,
        tenant: &TenantId,
        candidate: &AccountClassifier,
        calibration: &CalibrationModel,
    ) -> DriftResult<Option<String>> {
        if calibration.model_version_id != candidate.model_version_id {
            return Err(DriftError::Validation(format!(
                "calibration {} is not bound to model {}",
                calibration.model_version_id, candidate.model_version_id
            )));
        }
        let bytes = candidate
            .to_artifact()
            .map_err(|err| DriftError::Validation(err.to_string()))?;
        let blob_hash = self.blobs.put(bytes).await?;
        self.store
            .put_calibration_model(tenant, calibration.clone())
            .await?;

        let previous = self.store.current_pointer(tenant, MODEL_POINTER).await?;
        let swapped = self
            .store
            .compare_and_swap_pointer(tenant, MODEL_POINTER, previous.as_deref(), &blob_hash)
            .await?;
        if !swapped {
            return Err(DriftError::Validation(
                "lost the model pointer swap race".into(),
            ));
        }

        let backup = match previous {
            Some(prior_hash) => {
                let name = format!("model_backup_{}", self.clock.now().timestamp_millis());
                self.store
                    .compare_and_swap_pointer(tenant, &name, None, &prior_hash)
                    .await?;
                Some(name)
            }
            None => None,
        };
        info!(
            tenant = tenant.as_str(),
            model = candidate.model_version_id.as_str(),
            backup = backup.as_deref().unwrap_or("none"),
            "promoted classifier"
        );
        Ok(backup)
    }

    /// Restores the artifact a backup pointer names as the serving model.
    pub async fn rollback(&self, tenant: &TenantId, backup_name: &str) -> DriftResult<()> {
        let backup_hash = self
            .store
            .current_pointer(tenant, backup_name)
            .await?
            .ok_or_else(|| {
                DriftError::Validation(format!("no backup pointer {backup_name}"))
            })?;
        let current = self.store.current_pointer(tenant, MODEL_POINTER).await?;
        let swapped = self
            .store
            .compare_and_swap_pointer(tenant, MODEL_POINTER, current.as_deref(), &backup_hash)
            .await?;
        if !swapped {
            return Err(DriftError::Validation(
                "lost the model pointer swap race".into(),
            ));
        }
        info!(tenant = tenant.as_str(), backup_name, "rolled model back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tally_classifier::LabeledExample;
    use tally_classifier::fit_temperature;
    use tally_journal::InMemoryBlobStore;
    use tally_journal::InMemoryStore;
    use tally_journal::ManualClock;
    use tally_journal::Transaction;

    fn example(description: &str, amount: i64, account: &str) -> LabeledExample {
        LabeledExample {
            txn: Transaction {
                txn_id: format!("txn-{description}-{amount}"),
                tenant_id: "tenant-1".into(),
                posted_at: chrono::NaiveDate::from_ymd_opt(2025, 10, 1).expect("valid date"),
                amount_minor: amount,
                currency: "USD".into(),
                description_raw: description.into(),
                counterparty_raw: None,
                counterparty_norm: None,
                memo: None,
                mcc: None,
                source_file_id: "upload-1".into(),
                source_row_ref: "row:1".into(),
                ingested_at: Utc::now(),
            },
            account_code: account.into(),
        }
    }

    fn model(tag: &str) -> AccountClassifier {
        let examples = vec![
            example(&format!("AMZN {tag}"), -1000, "6100"),
            example(&format!("AMZN {tag} B"), -1100, "6100"),
            example(&format!("UBER {tag}"), -2000, "6300"),
            example(&format!("UBER {tag} B"), -2100, "6300"),
        ];
        AccountClassifier::train(&examples, Utc::now()).expect("train")
    }

    fn calibration_for(model: &AccountClassifier) -> CalibrationModel {
        let pairs: Vec<(f64, bool)> = (0..20).map(|i| (0.8, i % 5 != 0)).collect();
        fit_temperature(&pairs, &model.model_version_id, Utc::now()).expect("fit")
    }

    fn registry() -> ModelRegistry {
        let start = chrono::DateTime::parse_from_rfc3339("2025-10-20T00:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        ModelRegistry::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(ManualClock::at(start)),
        )
    }

    #[tokio::test]
    async fn promote_then_rollback_restores_prior_model() {
        let registry = registry();
        let tenant: TenantId = "tenant-1".into();
        assert!(registry.current(&tenant).await.expect("current").is_none());

        let first = model("one");
        let first_calibration = calibration_for(&first);
        let backup = registry
            .promote(&tenant, &first, &first_calibration)
            .await
            .expect("promote");
        assert!(backup.is_none(), "first promotion has nothing to back up");

        let (serving, calibration) = registry
            .current(&tenant)
            .await
            .expect("current")
            .expect("model exists");
        assert_eq!(serving.model_version_id, first.model_version_id);
        assert!(calibration.is_some());

        let second = model("two");
        let second_calibration = calibration_for(&second);
        let backup = registry
            .promote(&tenant, &second, &second_calibration)
            .await
            .expect("promote")
            .expect("backup pointer");
        assert!(backup.starts_with("model_backup_"));

        registry.rollback(&tenant, &backup).await.expect("rollback");
        let (serving, _) = registry
            .current(&tenant)
            .await
            .expect("current")
            .expect("model exists");
        assert_eq!(serving.model_version_id, first.model_version_id);
    }

    #[tokio::test]
    async fn promotion_rejects_unbound_calibration() {
        let registry = registry();
        let tenant: TenantId = "tenant-1".into();
        let candidate = model("one");
        let mut calibration = calibration_for(&candidate);
        calibration.model_version_id = "m-other".into();
        assert!(matches!(
            registry.promote(&tenant, &candidate, &calibration).await,
            Err(DriftError::Validation(_))
        ));
    }
}
