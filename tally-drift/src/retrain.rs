//! Shadow training with gated promotion. A candidate never serves until
//! it clears every quality gate against the production model on a
//! vendor-leakage-free, time-respecting holdout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use tally_audit::AppendEvent;
use tally_audit::AuditEventKind;
use tally_audit::AuditSink;
use tally_classifier::AccountClassifier;
use tally_classifier::EvalReport;
use tally_classifier::LabeledExample;
use tally_classifier::evaluate;
use tally_classifier::fit_isotonic;
use tally_classifier::per_bin_gaps;
use tally_journal::CalibrationModel;
use tally_journal::Clock;
use tally_journal::RetrainEvent;
use tally_journal::Store;
use tally_journal::TenantId;

use crate::DriftError;
use crate::DriftResult;
use crate::registry::ModelRegistry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrainerConfig {
    pub min_total_records: usize,
    /// Coarse per-record cost estimate used for the runtime guardrail.
    pub estimated_train_cost_per_record: Duration,
    pub max_expected_runtime: Duration,
    pub holdout_days: i64,
    /// Accuracy the candidate may lose against production, in
    /// percentage points.
    pub acc_tolerance_pp: f64,
    pub ece_abs_bound: f64,
    pub per_bin_bound: f64,
    pub account_accuracy_floor: f64,
    pub dry_run: bool,
}

impl Default for RetrainerConfig {
    fn default() -> Self {
        Self {
            min_total_records: 2000,
            estimated_train_cost_per_record: Duration::from_micros(300),
            max_expected_runtime: Duration::from_secs(900),
            holdout_days: 30,
            acc_tolerance_pp: 1.0,
            ece_abs_bound: 0.03,
            per_bin_bound: 0.05,
            account_accuracy_floor: 0.80,
            dry_run: false,
        }
    }
}

/// Vendor-keyed, time-respecting split. The newest `holdout_days` form
/// the holdout; any training example whose vendor also appears in the
/// holdout is dropped, so the vendor sets cannot overlap.
#[must_use]
pub fn split_time_respecting(
    examples: &[LabeledExample],
    as_of: NaiveDate,
    holdout_days: i64,
) -> (Vec<LabeledExample>, Vec<LabeledExample>) {
    let cutoff = as_of - chrono::Duration::days(holdout_days);
    let vendor_of = |example: &LabeledExample| -> String {
        example
            .txn
            .counterparty_norm
            .clone()
            .or_else(|| {
                example
                    .txn
                    .counterparty_raw
                    .as_deref()
                    .map(tally_vendor::normalize)
            })
            .unwrap_or_else(|| tally_vendor::normalize(&example.txn.description_raw))
    };

    let mut holdout = Vec::new();
    let mut older = Vec::new();
    for example in examples {
        if example.txn.posted_at > cutoff {
            holdout.push(example.clone());
        } else {
            older.push(example.clone());
        }
    }
    let holdout_vendors: HashSet<String> = holdout.iter().map(&vendor_of).collect();
    let train: Vec<LabeledExample> = older
        .into_iter()
        .filter(|example| !holdout_vendors.contains(&vendor_of(example)))
        .collect();
    (train, holdout)
}

fn vendor_overlap(train: &[LabeledExample], holdout: &[LabeledExample]) -> usize {
    let vendor_of = |example: &LabeledExample| -> String {
        example
            .txn
            .counterparty_norm
            .clone()
            .or_else(|| {
                example
                    .txn
                    .counterparty_raw
                    .as_deref()
                    .map(tally_vendor::normalize)
            })
            .unwrap_or_else(|| tally_vendor::normalize(&example.txn.description_raw))
    };
    let train_vendors: HashSet<String> = train.iter().map(&vendor_of).collect();
    holdout
        .iter()
        .filter(|example| train_vendors.contains(&vendor_of(example)))
        .count()
}

/// Metric bundle a gate decision is made from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateMetrics {
    pub accuracy: f64,
    pub macro_f1: f64,
    pub ece: f64,
    pub per_bin_gaps: Vec<f64>,
    pub min_account_accuracy: f64,
}

impl GateMetrics {
    fn from_eval(report: &EvalReport, ece: f64, gaps: Vec<f64>) -> Self {
        Self {
            accuracy: report.accuracy,
            macro_f1: report.macro_f1,
            ece,
            per_bin_gaps: gaps,
            min_account_accuracy: report
                .per_account_accuracy
                .values()
                .copied()
                .fold(1.0, f64::min),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub pass: bool,
    pub failures: Vec<String>,
}

/// All-must-hold promotion gates (§ candidate vs production).
#[must_use]
pub fn promotion_gates(
    candidate: &GateMetrics,
    production: Option<&GateMetrics>,
    leakage_overlap: usize,
    config: &RetrainerConfig,
) -> GateOutcome {
    let mut failures = Vec::new();

    if let Some(prod) = production {
        if candidate.accuracy < prod.accuracy - config.acc_tolerance_pp / 100.0 {
            failures.push(format!(
                "accuracy {:.4} below production {:.4} - {}pp",
                candidate.accuracy, prod.accuracy, config.acc_tolerance_pp
            ));
        }
        if candidate.macro_f1 < prod.macro_f1 {
            failures.push(format!(
                "macro f1 {:.4} below production {:.4}",
                candidate.macro_f1, prod.macro_f1
            ));
        }
        if candidate.ece > prod.ece && candidate.ece > config.ece_abs_bound {
            failures.push(format!(
                "ece {:.4} above production {:.4} and bound {:.2}",
                candidate.ece, prod.ece, config.ece_abs_bound
            ));
        }
    } else if candidate.ece > config.ece_abs_bound {
        failures.push(format!(
            "ece {:.4} above bound {:.2}",
            candidate.ece, config.ece_abs_bound
        ));
    }

    if let Some(worst) = candidate
        .per_bin_gaps
        .iter()
        .copied()
        .fold(None::<f64>, |acc, gap| Some(acc.map_or(gap, |a| a.max(gap))))
        && worst > config.per_bin_bound
    {
        failures.push(format!(
            "per-bin |pred-obs| {worst:.4} above bound {:.2}",
            config.per_bin_bound
        ));
    }

    if candidate.min_account_accuracy < config.account_accuracy_floor {
        failures.push(format!(
            "account group accuracy {:.4} below floor {:.2}",
            candidate.min_account_accuracy, config.account_accuracy_floor
        ));
    }

    if leakage_overlap > 0 {
        failures.push(format!(
            "vendor leakage: {leakage_overlap} holdout examples share train vendors"
        ));
    }

    GateOutcome {
        pass: failures.is_empty(),
        failures,
    }
}

#[derive(Debug)]
pub struct RetrainOutcome {
    pub event: RetrainEvent,
    pub promoted: bool,
    pub gate: GateOutcome,
    /// Backup pointer name when a prior model was displaced.
    pub backup_pointer: Option<String>,
}

pub struct Retrainer {
    store: Arc<dyn Store>,
    registry: Arc<ModelRegistry>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: RetrainerConfig,
}

impl Retrainer {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ModelRegistry>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: RetrainerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            clock,
            config,
        }
    }

    /// Shadow-trains on the labeled corpus and promotes only through the
    /// gates. Always records a RetrainEvent, promoted or not.
    pub async fn run(
        &self,
        tenant: &TenantId,
        examples: &[LabeledExample],
        reasons: Vec<String>,
    ) -> DriftResult<RetrainOutcome> {
        let started_at = self.clock.now();

        if examples.len() < self.config.min_total_records {
            return Err(DriftError::Training(format!(
                "{} records below the {} floor",
                examples.len(),
                self.config.min_total_records
            )));
        }
        let expected_runtime = self.config.estimated_train_cost_per_record * examples.len() as u32;
        if expected_runtime > self.config.max_expected_runtime {
            return Err(DriftError::Training(format!(
                "expected runtime {expected_runtime:?} exceeds {:?}",
                self.config.max_expected_runtime
            )));
        }
        if self.config.dry_run {
            let event = self
                .record_event(
                    tenant, started_at, &reasons, 0, 0, None, None, false, None, "dry-run",
                )
                .await?;
            return Ok(RetrainOutcome {
                event,
                promoted: false,
                gate: GateOutcome {
                    pass: false,
                    failures: vec!["dry-run".into()],
                },
                backup_pointer: None,
            });
        }

        let (train, holdout) = split_time_respecting(
            examples,
            started_at.date_naive(),
            self.config.holdout_days,
        );
        if train.is_empty() || holdout.is_empty() {
            return Err(DriftError::Training(format!(
                "unusable split: {} train / {} holdout",
                train.len(),
                holdout.len()
            )));
        }
        let leakage = vendor_overlap(&train, &holdout);

        let candidate = AccountClassifier::train(&train, started_at)
            .map_err(|err| DriftError::Training(err.to_string()))?;
        let candidate_eval = evaluate(&candidate, &holdout);
        let calibration = fit_isotonic(
            &candidate_eval.score_pairs,
            &candidate.model_version_id,
            started_at,
        )
        .map_err(|err| DriftError::Training(err.to_string()))?;
        let calibrated_pairs: Vec<(f64, bool)> = candidate_eval
            .score_pairs
            .iter()
            .map(|(p, hit)| (tally_classifier::apply_calibration(&calibration, *p), *hit))
            .collect();
        let candidate_metrics = GateMetrics::from_eval(
            &candidate_eval,
            calibration.ece,
            per_bin_gaps(&calibrated_pairs, &calibration.bin_edges),
        );

        let production = self.registry.current(tenant).await?;
        let production_metrics = match &production {
            Some((prod_model, prod_calibration)) => {
                let eval = evaluate(prod_model, &holdout);
                let (ece, gaps) = match prod_calibration {
                    Some(model) => {
                        let pairs: Vec<(f64, bool)> = eval
                            .score_pairs
                            .iter()
                            .map(|(p, hit)| {
                                (tally_classifier::apply_calibration(model, *p), *hit)
                            })
                            .collect();
                        (
                            tally_classifier::expected_calibration_error(
                                &pairs,
                                &model.bin_edges,
                            ),
                            per_bin_gaps(&pairs, &model.bin_edges),
                        )
                    }
                    None => (1.0, Vec::new()),
                };
                Some(GateMetrics::from_eval(&eval, ece, gaps))
            }
            None => None,
        };

        let gate = promotion_gates(
            &candidate_metrics,
            production_metrics.as_ref(),
            leakage,
            &self.config,
        );

        let mut backup_pointer = None;
        if gate.pass {
            backup_pointer = self.registry.promote(tenant, &candidate, &calibration).await?;
            info!(
                tenant = tenant.as_str(),
                model = candidate.model_version_id.as_str(),
                "candidate promoted"
            );
        } else {
            warn!(
                tenant = tenant.as_str(),
                failures = %gate.failures.join("; "),
                "candidate rejected, production model retained"
            );
        }

        let event = self
            .record_event(
                tenant,
                started_at,
                &reasons,
                train.len(),
                holdout.len(),
                production_metrics.as_ref(),
                Some(&candidate_metrics),
                gate.pass,
                gate.pass.then(|| candidate.model_version_id.clone()),
                &if gate.pass {
                    format!("promoted {}", candidate.model_version_id)
                } else {
                    format!("rejected: {}", gate.failures.join("; "))
                },
            )
            .await?;

        Ok(RetrainOutcome {
            event,
            promoted: gate.pass,
            gate,
            backup_pointer,
        })
    }

    /// Restores a backup model and records the reversal.
    pub async fn rollback(&self, tenant: &TenantId, backup_pointer: &str) -> DriftResult<()> {
        self.registry.rollback(tenant, backup_pointer).await?;
        let now = self.clock.now();
        let event = RetrainEvent {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            started_at: now,
            finished_at: now,
            reasons: vec![format!("rollback to {backup_pointer}")],
            train_n: 0,
            valid_n: 0,
            acc_old: 0.0,
            acc_new: 0.0,
            f1_old: 0.0,
            f1_new: 0.0,
            promoted: false,
            artifact_id: None,
            notes: format!("restored {backup_pointer}"),
        };
        self.store.append_retrain_event(event.clone()).await?;
        self.audit
            .append(AppendEvent {
                tenant_id: tenant.clone(),
                entity_id: backup_pointer.to_owned(),
                kind: AuditEventKind::ModelRollback,
                actor: "retrainer".into(),
                payload: serde_json::json!({ "backup_pointer": backup_pointer }),
            })
            .await
            .map_err(|err| DriftError::Audit(err.to_string()))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_event(
        &self,
        tenant: &TenantId,
        started_at: chrono::DateTime<chrono::Utc>,
        reasons: &[String],
        train_n: usize,
        valid_n: usize,
        production: Option<&GateMetrics>,
        candidate: Option<&GateMetrics>,
        promoted: bool,
        artifact_id: Option<String>,
        notes: &str,
    ) -> DriftResult<RetrainEvent> {
        let event = RetrainEvent {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            started_at,
            finished_at: self.clock.now(),
            reasons: reasons.to_vec(),
            train_n,
            valid_n,
            acc_old: production.map(|m| m.accuracy).unwrap_or(0.0),
            acc_new: candidate.map(|m| m.accuracy).unwrap_or(0.0),
            f1_old: production.map(|m| m.macro_f1).unwrap_or(0.0),
            f1_new: candidate.map(|m| m.macro_f1).unwrap_or(0.0),
            promoted,
            artifact_id,
            notes: notes.to_owned(),
        };
        self.store.append_retrain_event(event.clone()).await?;
        self.audit
            .append(AppendEvent {
                tenant_id: tenant.clone(),
                entity_id: event.id.clone(),
                kind: AuditEventKind::Retrain,
                actor: "retrainer".into(),
                payload: serde_json::json!({
                    "promoted": promoted,
                    "train_n": train_n,
                    "valid_n": valid_n,
                    "notes": notes,
                }),
            })
            .await
            .map_err(|err| DriftError::Audit(err.to_string()))?;
        Ok(event)
    }
}
