#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Decision pipeline: normalize, fan signals out per transaction, blend,
//! gate, build the entry, and either auto-post or queue for review.
//! Signal failures degrade; only storage failures abort a batch.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use tally_audit::AppendEvent;
use tally_audit::AuditEventKind;
use tally_audit::AuditSink;
use tally_classifier::AccountClassifier;
use tally_classifier::apply_calibration;
use tally_drift::DriftError;
use tally_drift::ModelRegistry;
use tally_journal::AccountCode;
use tally_journal::CalibrationModel;
use tally_journal::Clock;
use tally_journal::Confirmation;
use tally_journal::DecisionTrace;
use tally_journal::InvariantError;
use tally_journal::JournalEntryId;
use tally_journal::NotAutoPostReason;
use tally_journal::Route;
use tally_journal::RuleVersion;
use tally_journal::SettingsError;
use tally_journal::StorageError;
use tally_journal::Store;
use tally_journal::TenantId;
use tally_journal::TenantSettings;
use tally_journal::TraceSignal;
use tally_journal::Transaction;
use tally_journal::TxnId;
use tally_llm::AdjudicationRequest;
use tally_llm::CoaEntry;
use tally_llm::HistoricalMapping;
use tally_llm::LlmAdjudicator;
use tally_llm::LlmSignal;
use tally_memory::EmbeddingMemory;
use tally_memory::MemoryError;
use tally_rules::RuleEngine;
use tally_rules::RuleEvaluation;
use tally_rules::RuleVersionStore;
use tally_rules::RulesError;

mod blender;
mod builder;
mod gate;
mod review;

pub use blender::BlendOutcome;
pub use blender::SignalScore;
pub use blender::blend;
pub use builder::build_entry;
pub use gate::GateDecision;
pub use gate::GateInputs;
pub use gate::decide;
pub use review::ReviewDesk;
pub use review::ReviewItem;
pub use review::ReviewStatus;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    #[error(transparent)]
    Rules(#[from] RulesError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Drift(#[from] DriftError),
    #[error("audit sink failure: {0}")]
    Audit(String),
    #[error("review error: {0}")]
    Review(String),
}

/// Outcome for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub txn_id: TxnId,
    pub route: Route,
    pub reason: Option<NotAutoPostReason>,
    /// Missing when the builder could not produce an entry at all.
    pub je_id: Option<JournalEntryId>,
    pub account_code: Option<AccountCode>,
    pub blend_score: f64,
    pub calibrated_p: Option<f64>,
    pub posted: bool,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub decisions: Vec<Decision>,
}

impl BatchOutcome {
    #[must_use]
    pub fn auto_posted(&self) -> usize {
        self.decisions.iter().filter(|d| d.posted).count()
    }

    #[must_use]
    pub fn routed_to_review(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.route == Route::Review)
            .count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Evaluate without writing entries or confirmations.
    pub dry_run: bool,
}

struct BatchContext {
    tenant: TenantId,
    settings: TenantSettings,
    rule_version: Option<Arc<RuleVersion>>,
    classifier: Option<Arc<AccountClassifier>>,
    calibration: Option<Arc<CalibrationModel>>,
    coa: Vec<CoaEntry>,
    options: BatchOptions,
}

pub struct DecisionPipeline {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    rule_versions: Arc<RuleVersionStore>,
    memory: Arc<EmbeddingMemory>,
    registry: Arc<ModelRegistry>,
    adjudicator: Option<Arc<LlmAdjudicator>>,
    review_desk: Option<Arc<ReviewDesk>>,
    engine: RuleEngine,
    max_fanout: usize,
}

impl DecisionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        rule_versions: Arc<RuleVersionStore>,
        memory: Arc<EmbeddingMemory>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            rule_versions,
            memory,
            registry,
            adjudicator: None,
            review_desk: None,
            engine: RuleEngine::new(),
            max_fanout: 16,
        }
    }

    #[must_use]
    pub fn with_adjudicator(mut self, adjudicator: Arc<LlmAdjudicator>) -> Self {
        self.adjudicator = Some(adjudicator);
        self
    }

    /// Review routes enqueue onto this desk as part of the batch.
    #[must_use]
    pub fn with_review_desk(mut self, review_desk: Arc<ReviewDesk>) -> Self {
        self.review_desk = Some(review_desk);
        self
    }

    #[must_use]
    pub fn with_max_fanout(mut self, max_fanout: usize) -> Self {
        self.max_fanout = max_fanout.max(1);
        self
    }

    /// Runs a batch with bounded fan-out. Proposals may land out of
    /// input order; decisions are returned in completion order.
    pub async fn process_batch(
        &self,
        tenant: &TenantId,
        transactions: Vec<Transaction>,
        options: BatchOptions,
    ) -> PipelineResult<BatchOutcome> {
        let settings = self
            .store
            .tenant_settings(tenant)
            .await?
            .unwrap_or_default();
        settings.validate()?;

        let rule_version = self.rule_versions.current(tenant).await?;
        let (classifier, calibration) = match self.registry.current(tenant).await? {
            Some((classifier, calibration)) => {
                (Some(Arc::new(classifier)), calibration.map(Arc::new))
            }
            None => (None, None),
        };
        let coa: Vec<CoaEntry> = self
            .store
            .list_accounts(tenant)
            .await?
            .into_iter()
            .filter(|account| account.active)
            .map(|account| CoaEntry {
                code: account.code,
                name: account.name,
                account_type: account.account_type,
            })
            .collect();

        let context = Arc::new(BatchContext {
            tenant: tenant.clone(),
            settings,
            rule_version,
            classifier,
            calibration,
            coa,
            options,
        });

        let fanout = self.max_fanout.min(transactions.len().max(1));
        info!(
            tenant = tenant.as_str(),
            batch = transactions.len(),
            fanout,
            dry_run = options.dry_run,
            "processing batch"
        );

        let mut decisions = Vec::with_capacity(transactions.len());
        let mut work = stream::iter(
            transactions
                .into_iter()
                .map(|txn| self.decide_one(context.clone(), txn)),
        )
        .buffer_unordered(fanout);
        while let Some(result) = work.next().await {
            // Storage and concurrency failures abort the batch; entries
            // already written stay (they are reproducible by txn id).
            decisions.push(result?);
        }

        Ok(BatchOutcome { decisions })
    }

    async fn decide_one(
        &self,
        context: Arc<BatchContext>,
        mut txn: Transaction,
    ) -> PipelineResult<Decision> {
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
        txn.counterparty_norm = Some(vendor_norm.clone());
        let description_norm = tally_vendor::normalize(&txn.description_raw);

        // Rules are synchronous over the published snapshot; memory
        // retrieval may suspend. Both settle before blending.
        let rule_eval = match &context.rule_version {
            Some(version) => self.engine.evaluate(version, &txn),
            None => RuleEvaluation::default(),
        };
        let memory_signal = self
            .memory
            .retrieve(&context.tenant, &description_norm, &vendor_norm)
            .await?;

        let prediction = context.classifier.as_ref().map(|model| model.predict(&txn));
        let ml_top = prediction
            .as_ref()
            .and_then(|prediction| prediction.top().map(|(code, p)| (code.clone(), p)));
        let calibrated_p = match (&context.calibration, &ml_top) {
            (Some(calibration), Some((_, p))) => Some(apply_calibration(calibration, *p)),
            _ => None,
        };

        let mut trace = DecisionTrace {
            vendor_norm: Some(vendor_norm.clone()),
            rule_version_id: context
                .rule_version
                .as_ref()
                .map(|version| version.version_id.clone()),
            model_version_id: context
                .classifier
                .as_ref()
                .map(|model| model.model_version_id.clone()),
            calibration_method: context
                .calibration
                .as_ref()
                .map(|calibration| format!("{:?}", calibration.method).to_lowercase()),
            ..DecisionTrace::default()
        };

        let rules_signal = match &rule_eval.matched {
            Some(matched) if !rule_eval.is_conflict() => {
                trace.push(TraceSignal::Rule {
                    rule_id: matched.rule_id.clone(),
                    match_type: matched.match_type,
                    pattern: matched.pattern.clone(),
                    account_code: matched.account_code.clone(),
                    score: 1.0,
                });
                SignalScore::suggest(&matched.account_code, 1.0)
            }
            Some(matched) => {
                for conflicting in &rule_eval.conflicting {
                    trace.push(TraceSignal::Rule {
                        rule_id: conflicting.rule_id.clone(),
                        match_type: conflicting.match_type,
                        pattern: conflicting.pattern.clone(),
                        account_code: conflicting.account_code.clone(),
                        score: 1.0,
                    });
                }
                // Conflicted rules still seed the blender; the gate
                // blocks the result.
                SignalScore::suggest(&matched.account_code, 1.0)
            }
            None => {
                trace.push(TraceSignal::System {
                    note: "rules: no match".into(),
                });
                SignalScore::none()
            }
        };

        // The model slot takes the classifier when it speaks, otherwise
        // the embedding memory's vote.
        let ml_signal = match (&ml_top, &memory_signal.account_code) {
            (Some((code, p)), memory_account) => {
                trace.push(TraceSignal::Ml {
                    model_version_id: context
                        .classifier
                        .as_ref()
                        .map(|model| model.model_version_id.clone())
                        .unwrap_or_default(),
                    account_code: code.clone(),
                    score: *p,
                    calibrated_p,
                });
                if let Some(memory_account) = memory_account {
                    trace.push(TraceSignal::System {
                        note: format!(
                            "memory vote {memory_account} score {:.3}",
                            memory_signal.score
                        ),
                    });
                    if memory_signal.score > *p {
                        SignalScore::suggest(memory_account, memory_signal.score)
                    } else {
                        SignalScore::suggest(code, *p)
                    }
                } else {
                    SignalScore::suggest(code, *p)
                }
            }
            (None, Some(memory_account)) => {
                trace.push(TraceSignal::System {
                    note: format!(
                        "memory vote {memory_account} score {:.3}",
                        memory_signal.score
                    ),
                });
                SignalScore::suggest(memory_account, memory_signal.score)
            }
            (None, None) => {
                trace.push(TraceSignal::System {
                    note: "model signals unavailable".into(),
                });
                SignalScore::none()
            }
        };

        // Preliminary blend decides whether the uncertain band requires
        // an LLM opinion at all.
        let preliminary = blend(
            &context.settings.blend_weights,
            &rules_signal,
            &ml_signal,
            &SignalScore::none(),
        );
        let signals_disagree = match (&rules_signal.account_code, &ml_signal.account_code) {
            (Some(rule_account), Some(model_account)) => rule_account != model_account,
            _ => false,
        };
        let llm_required = preliminary.account_code.is_some()
            && (context.settings.llm_band.contains(preliminary.blend_score) || signals_disagree);

        let llm_signal = if llm_required {
            match &self.adjudicator {
                Some(adjudicator) => {
                    let historical = self
                        .store
                        .recent_confirmations(&context.tenant, &vendor_norm, 5)
                        .await?
                        .into_iter()
                        .map(|confirmation| HistoricalMapping {
                            vendor_norm: confirmation.vendor_norm,
                            account_code: confirmation.account_code,
                            confirmations: 1,
                        })
                        .collect();
                    let request = AdjudicationRequest {
                        tenant_id: context.tenant.clone(),
                        posted_at: txn.posted_at,
                        amount_minor: txn.amount_minor,
                        currency: txn.currency.clone(),
                        description_norm: description_norm.clone(),
                        counterparty_norm: vendor_norm.clone(),
                        memo: txn.memo.clone(),
                        accounts: context.coa.clone(),
                        historical,
                    };
                    adjudicator
                        .adjudicate(
                            context.settings.llm_daily_call_cap,
                            context.settings.llm_daily_cost_cap_microcents,
                            &request,
                        )
                        .await
                }
                None => LlmSignal {
                    account_code: None,
                    score: 0.0,
                    rationale: None,
                    needs_review: false,
                    degraded: Some("llm_not_configured".into()),
                },
            }
        } else {
            LlmSignal {
                account_code: None,
                score: 0.0,
                rationale: None,
                needs_review: false,
                degraded: None,
            }
        };
        trace.push(TraceSignal::Llm {
            account_code: llm_signal.account_code.clone(),
            score: llm_signal.score,
            rationale: llm_signal.rationale.clone(),
            degraded: if llm_required {
                llm_signal.degraded.clone()
            } else {
                Some("not_consulted".into())
            },
        });

        let outcome = blend(
            &context.settings.blend_weights,
            &rules_signal,
            &ml_signal,
            &SignalScore {
                account_code: llm_signal.account_code.clone(),
                score: llm_signal.score,
            },
        );

        // Build the candidate entry; a missing CoA mapping degrades into
        // an imbalance review for this transaction only.
        let candidate = match &outcome.account_code {
            Some(account) => {
                let rationale = rationale_for(&rule_eval, &ml_top, &llm_signal, account);
                match build_entry(
                    format!("je-{}", Uuid::new_v4()),
                    &txn,
                    account,
                    &context.settings,
                    outcome.blend_score,
                    calibrated_p,
                    rationale,
                    trace.clone(),
                ) {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        debug!(txn = txn.txn_id.as_str(), %err, "entry build failed");
                        None
                    }
                }
            }
            None => None,
        };

        let recent: Vec<AccountCode> = self
            .store
            .recent_confirmations(
                &context.tenant,
                &vendor_norm,
                context.settings.cold_start_min,
            )
            .await?
            .into_iter()
            .map(|confirmation| confirmation.account_code)
            .collect();
        let history = match &outcome.account_code {
            Some(account) => {
                self.store
                    .posted_amounts_for_account(&context.tenant, account)
                    .await?
            }
            None => Vec::new(),
        };

        let gate_decision = decide(&GateInputs {
            settings: &context.settings,
            rule: &rule_eval,
            blend: &outcome,
            calibrated_p,
            recent_confirmations: &recent,
            candidate_entry: candidate.as_ref(),
            llm_required,
            llm_degraded: llm_signal.is_degraded(),
            account_history_amounts: &history,
            amount_minor: txn.amount_minor,
        });

        let mut posted = false;
        let je_id = match candidate {
            Some(mut entry) => {
                entry.review_reason = gate_decision.reason;
                entry.decision_trace.reasons = gate_decision.reasons.clone();
                if gate_decision.anomaly_informational {
                    entry
                        .decision_trace
                        .push(TraceSignal::System {
                            note: "amount outside robust band (informational)".into(),
                        });
                }
                let je_id = entry.je_id.clone();
                if !context.options.dry_run {
                    if gate_decision.route == Route::AutoPost && context.settings.autopost_enabled
                    {
                        entry.approve()?;
                        entry.post()?;
                        posted = true;
                    }
                    self.store.put_journal_entry(entry.clone()).await?;
                    if posted {
                        self.confirm(&context.tenant, &txn, &vendor_norm, &entry).await?;
                    }
                    self.audit
                        .append(AppendEvent {
                            tenant_id: context.tenant.clone(),
                            entity_id: je_id.clone(),
                            kind: AuditEventKind::Decision,
                            actor: "pipeline".into(),
                            payload: serde_json::json!({
                                "txn_id": txn.txn_id,
                                "route": entry_route_label(gate_decision.route),
                                "reason": gate_decision.reason,
                                "account": outcome.account_code,
                                "blend_score": outcome.blend_score,
                                "posted": posted,
                            }),
                        })
                        .await
                        .map_err(|err| PipelineError::Audit(err.to_string()))?;
                }
                Some(je_id)
            }
            None => None,
        };

        if let (Route::Review, Some(reason), Some(desk), false) = (
            gate_decision.route,
            gate_decision.reason,
            self.review_desk.as_ref(),
            context.options.dry_run,
        ) {
            desk.enqueue(&context.tenant, &txn.txn_id, je_id.clone(), reason)
                .await;
        }

        Ok(Decision {
            txn_id: txn.txn_id,
            route: gate_decision.route,
            reason: gate_decision.reason,
            je_id,
            account_code: outcome.account_code,
            blend_score: outcome.blend_score,
            calibrated_p,
            posted,
        })
    }

    async fn confirm(
        &self,
        tenant: &TenantId,
        txn: &Transaction,
        vendor_norm: &str,
        entry: &tally_journal::JournalEntry,
    ) -> PipelineResult<()> {
        // The category side is whichever line is not the cash account;
        // the debit line carries it for outflows, the credit line for
        // inflows.
        let line_index = usize::from(txn.amount_minor >= 0);
        let account = entry.lines[line_index].account_code.clone();
        self.store
            .append_confirmation(Confirmation {
                tenant_id: tenant.clone(),
                vendor_norm: vendor_norm.to_owned(),
                account_code: account.clone(),
                txn_id: txn.txn_id.clone(),
                confirmed_at: self.clock.now(),
            })
            .await?;
        let description_norm = tally_vendor::normalize(&txn.description_raw);
        self.memory
            .record_confirmed(tenant, vendor_norm, &account, &description_norm)
            .await?;
        Ok(())
    }
}

fn entry_route_label(route: Route) -> &'static str {
    match route {
        Route::AutoPost => "auto_post",
        Route::Review => "review",
    }
}

fn rationale_for(
    rule_eval: &RuleEvaluation,
    ml_top: &Option<(AccountCode, f64)>,
    llm_signal: &LlmSignal,
    account: &AccountCode,
) -> String {
    if let Some(matched) = &rule_eval.matched
        && matched.account_code == *account
        && !rule_eval.is_conflict()
    {
        return format!(
            "rule {} ({} \"{}\")",
            matched.rule_id,
            match matched.match_type {
                tally_journal::RuleMatchType::Exact => "exact",
                tally_journal::RuleMatchType::Regex => "regex",
                tally_journal::RuleMatchType::Mcc => "mcc",
                tally_journal::RuleMatchType::MemoSubstring => "memo",
            },
            matched.pattern
        );
    }
    if let Some(rationale) = &llm_signal.rationale
        && llm_signal.account_code.as_ref() == Some(account)
    {
        return format!("llm: {rationale}");
    }
    match ml_top {
        Some((code, p)) if code == account => format!("classifier p={p:.3}"),
        _ => "blended signals".into(),
    }
}
