use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono::Utc;
use pretty_assertions::assert_eq;

use tally_audit::AuditSink;
use tally_audit::InMemoryAuditSink;
use tally_classifier::AccountClassifier;
use tally_classifier::LabeledExample;
use tally_drift::ModelRegistry;
use tally_journal::Account;
use tally_journal::AccountType;
use tally_journal::CalibrationMethod;
use tally_journal::CalibrationModel;
use tally_journal::CalibrationParameters;
use tally_journal::Clock;
use tally_journal::Confirmation;
use tally_journal::EntryStatus;
use tally_journal::InMemoryBlobStore;
use tally_journal::InMemoryStore;
use tally_journal::ManualClock;
use tally_journal::NotAutoPostReason;
use tally_journal::Route;
use tally_journal::RuleDefinition;
use tally_journal::RuleMatchType;
use tally_journal::RuleSource;
use tally_journal::Store;
use tally_journal::TenantId;
use tally_journal::TenantSettings;
use tally_journal::TraceSignal;
use tally_journal::Transaction;
use tally_memory::EmbeddingClient;
use tally_memory::EmbeddingMemory;
use tally_memory::MemoryConfig;
use tally_pipeline::BatchOptions;
use tally_pipeline::DecisionPipeline;
use tally_rules::RuleVersionStore;

struct OfflineEmbeddings;

#[async_trait]
impl EmbeddingClient for OfflineEmbeddings {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
        Err("embedding backend offline".into())
    }
}

struct World {
    tenant: TenantId,
    store: Arc<InMemoryStore>,
    pipeline: DecisionPipeline,
}

fn amazon_rule(account: &str, id: &str, priority: i32) -> RuleDefinition {
    RuleDefinition {
        id: id.into(),
        match_type: RuleMatchType::Exact,
        pattern: "amazon".into(),
        account_code: account.into(),
        priority,
        author: "ops".into(),
        source: RuleSource::Human,
    }
}

fn labeled(description: &str, counterparty: &str, amount: i64, account: &str) -> LabeledExample {
    LabeledExample {
        txn: Transaction {
            txn_id: format!("train-{description}-{amount}"),
            tenant_id: "tenant-1".into(),
            posted_at: NaiveDate::from_ymd_opt(2025, 9, 1).expect("valid date"),
            amount_minor: amount,
            currency: "USD".into(),
            description_raw: description.into(),
            counterparty_raw: Some(counterparty.into()),
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

async fn build_world(autopost: bool, rules: Vec<RuleDefinition>, confirmations: usize) -> World {
    let tenant: TenantId = "tenant-1".into();
    let start = chrono::DateTime::parse_from_rfc3339("2025-10-20T09:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc);
    let clock = Arc::new(ManualClock::at(start));
    let store = Arc::new(InMemoryStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let audit: Arc<dyn AuditSink> = InMemoryAuditSink::shared();

    let mut settings = TenantSettings::default();
    settings.autopost_enabled = autopost;
    settings
        .cash_account_by_source
        .insert("upload-1".into(), "1000".into());
    store
        .put_tenant_settings(&tenant, settings)
        .await
        .expect("settings");

    for (code, name, account_type) in [
        ("1000", "Cash", AccountType::Asset),
        ("4000", "Revenue", AccountType::Revenue),
        ("6100", "Supplies", AccountType::Expense),
        ("6300", "Travel", AccountType::Expense),
        ("6500", "Software", AccountType::Expense),
    ] {
        store
            .upsert_account(Account {
                code: code.into(),
                tenant_id: tenant.clone(),
                name: name.into(),
                account_type,
                active: true,
            })
            .await
            .expect("account");
    }

    // Serving classifier plus a calibration that pins calibrated_p for
    // every prediction, keeping threshold outcomes deterministic.
    let examples = vec![
        labeled("AMZN Mktp US", "AMAZON", -1245, "6100"),
        labeled("AMZN Mktp US*B", "AMAZON", -2200, "6100"),
        labeled("AMZN Mktp US*C", "AMAZON", -900, "6100"),
        labeled("UBER *TRIP", "UBER", -1800, "6300"),
        labeled("UBER *TRIP B", "UBER", -2500, "6300"),
        labeled("UBER *TRIP C", "UBER", -2100, "6300"),
        labeled("PAYROLL ACME", "ACME CORP", 250_000, "4000"),
        labeled("PAYROLL ACME B", "ACME CORP", 250_000, "4000"),
    ];
    let classifier = AccountClassifier::train(&examples, clock.now()).expect("train");
    let calibration = CalibrationModel {
        model_version_id: classifier.model_version_id.clone(),
        method: CalibrationMethod::Isotonic,
        parameters: CalibrationParameters::Isotonic {
            thresholds: vec![1.0],
            values: vec![0.84],
        },
        trained_at: clock.now(),
        ece: 0.02,
        brier: 0.1,
        bin_edges: (0..=10).map(|i| f64::from(i) / 10.0).collect(),
    };
    let registry = Arc::new(ModelRegistry::new(store.clone(), blobs.clone(), clock.clone()));
    registry
        .promote(&tenant, &classifier, &calibration)
        .await
        .expect("promote model");

    let versions = Arc::new(RuleVersionStore::new(
        store.clone(),
        blobs.clone(),
        clock.clone(),
    ));
    if !rules.is_empty() {
        versions
            .publish(&tenant, rules, "ops", "seed")
            .await
            .expect("publish rules");
    }

    for i in 0..confirmations {
        clock.advance(std::time::Duration::from_secs(60));
        store
            .append_confirmation(Confirmation {
                tenant_id: tenant.clone(),
                vendor_norm: "amazon".into(),
                account_code: "6100".into(),
                txn_id: format!("prior-{i}"),
                confirmed_at: clock.now(),
            })
            .await
            .expect("confirmation");
    }

    let memory = Arc::new(EmbeddingMemory::new(
        store.clone(),
        Arc::new(OfflineEmbeddings),
        clock.clone(),
        MemoryConfig::default(),
    ));

    let pipeline = DecisionPipeline::new(
        store.clone(),
        audit,
        clock.clone(),
        versions,
        memory,
        registry,
    );

    World {
        tenant,
        store,
        pipeline,
    }
}

fn amazon_txn() -> Transaction {
    Transaction {
        txn_id: "txn-s1".into(),
        tenant_id: "tenant-1".into(),
        posted_at: NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date"),
        amount_minor: -1245,
        currency: "USD".into(),
        description_raw: "AMZN Mktp US*RT5WQ9".into(),
        counterparty_raw: Some("AMAZON".into()),
        counterparty_norm: None,
        memo: None,
        mcc: None,
        source_file_id: "upload-1".into(),
        source_row_ref: "row:3".into(),
        ingested_at: Utc::now(),
    }
}

/// S1: a deterministic rule hit on a warm vendor auto-posts a balanced
/// entry that debits the rule's account and credits cash.
#[tokio::test]
async fn s1_rule_hit_auto_posts() {
    let world = build_world(true, vec![amazon_rule("6100", "rule-amazon", 10)], 3).await;

    let outcome = world
        .pipeline
        .process_batch(&world.tenant, vec![amazon_txn()], BatchOptions::default())
        .await
        .expect("batch");

    assert_eq!(outcome.decisions.len(), 1);
    let decision = &outcome.decisions[0];
    assert_eq!(decision.route, Route::AutoPost);
    assert_eq!(decision.reason, None);
    assert!(decision.posted);
    assert_eq!(decision.account_code.as_deref(), Some("6100"));

    let je_id = decision.je_id.clone().expect("entry id");
    let entry = world
        .store
        .journal_entry(&world.tenant, &je_id)
        .await
        .expect("read")
        .expect("entry exists");
    assert_eq!(entry.status, EntryStatus::Posted);
    assert!(entry.is_balanced());
    assert_eq!(entry.lines[0].account_code, "6100");
    assert_eq!(entry.lines[0].debit_minor, 1245);
    assert_eq!(entry.lines[1].account_code, "1000");
    assert_eq!(entry.lines[1].credit_minor, 1245);
    assert!(entry.rationale.contains("rule-amazon"));

    // The auto-post confirmed the mapping for future cold-start checks.
    let confirmations = world
        .store
        .recent_confirmations(&world.tenant, "amazon", 10)
        .await
        .expect("confirmations");
    assert_eq!(confirmations.len(), 4);
}

/// S2: the same transaction with a single prior confirmation routes to
/// review as a cold start; the entry is still balanced and proposed.
#[tokio::test]
async fn s2_cold_vendor_routes_to_review() {
    let world = build_world(true, vec![amazon_rule("6100", "rule-amazon", 10)], 1).await;

    let outcome = world
        .pipeline
        .process_batch(&world.tenant, vec![amazon_txn()], BatchOptions::default())
        .await
        .expect("batch");

    let decision = &outcome.decisions[0];
    assert_eq!(decision.route, Route::Review);
    assert_eq!(decision.reason, Some(NotAutoPostReason::ColdStart));
    assert!(!decision.posted);

    let entry = world
        .store
        .journal_entry(&world.tenant, decision.je_id.as_ref().expect("entry id"))
        .await
        .expect("read")
        .expect("entry exists");
    assert_eq!(entry.status, EntryStatus::Proposed);
    assert!(entry.is_balanced());
    assert_eq!(entry.review_reason, Some(NotAutoPostReason::ColdStart));
}

/// S3: with no rule in play and a calibrated probability below the 0.90
/// threshold, the decision reviews as below_threshold and the trace
/// carries all three signal families.
#[tokio::test]
async fn s3_below_threshold_records_all_signals() {
    let world = build_world(true, vec![], 3).await;

    let outcome = world
        .pipeline
        .process_batch(&world.tenant, vec![amazon_txn()], BatchOptions::default())
        .await
        .expect("batch");

    let decision = &outcome.decisions[0];
    assert_eq!(decision.route, Route::Review);
    assert_eq!(decision.reason, Some(NotAutoPostReason::BelowThreshold));
    let calibrated_p = decision.calibrated_p.expect("calibrated");
    assert!((calibrated_p - 0.84).abs() < 1e-9);

    let entry = world
        .store
        .journal_entry(&world.tenant, decision.je_id.as_ref().expect("entry id"))
        .await
        .expect("read")
        .expect("entry exists");
    let signals = &entry.decision_trace.signals;
    assert!(
        signals
            .iter()
            .any(|signal| matches!(signal, TraceSignal::System { note } if note.contains("rules"))),
        "rules family missing from trace: {signals:?}"
    );
    assert!(signals.iter().any(|signal| matches!(signal, TraceSignal::Ml { .. })));
    assert!(signals.iter().any(|signal| matches!(signal, TraceSignal::Llm { .. })));
}

/// S4: two rules matching the same vendor at equal priority with
/// different accounts block the decision as a rule conflict, though a
/// candidate entry is still produced.
#[tokio::test]
async fn s4_equal_priority_conflict_blocks() {
    let world = build_world(
        true,
        vec![
            amazon_rule("6100", "rule-a", 10),
            amazon_rule("6500", "rule-b", 10),
        ],
        3,
    )
    .await;

    let outcome = world
        .pipeline
        .process_batch(&world.tenant, vec![amazon_txn()], BatchOptions::default())
        .await
        .expect("batch");

    let decision = &outcome.decisions[0];
    assert_eq!(decision.route, Route::Review);
    assert_eq!(decision.reason, Some(NotAutoPostReason::RuleConflict));
    assert!(decision.account_code.is_some(), "blender still picks a candidate");
    assert!(decision.je_id.is_some());
    assert!(!decision.posted);
}

/// Dry-run batches decide without writing anything.
#[tokio::test]
async fn dry_run_writes_nothing() {
    let world = build_world(true, vec![amazon_rule("6100", "rule-amazon", 10)], 3).await;

    let outcome = world
        .pipeline
        .process_batch(
            &world.tenant,
            vec![amazon_txn()],
            BatchOptions { dry_run: true },
        )
        .await
        .expect("batch");
    assert_eq!(outcome.decisions[0].route, Route::AutoPost);
    assert!(!outcome.decisions[0].posted);

    let entries = world
        .store
        .list_journal_entries(&world.tenant)
        .await
        .expect("entries");
    assert!(entries.is_empty());
}

/// Batches fan out concurrently but every transaction still gets exactly
/// one decision.
#[tokio::test]
async fn batch_fanout_decides_every_transaction() {
    let world = build_world(true, vec![amazon_rule("6100", "rule-amazon", 10)], 3).await;

    let mut batch = Vec::new();
    for i in 0..40 {
        let mut txn = amazon_txn();
        txn.txn_id = format!("txn-{i}");
        txn.amount_minor = -1000 - i;
        batch.push(txn);
    }
    let outcome = world
        .pipeline
        .process_batch(&world.tenant, batch, BatchOptions::default())
        .await
        .expect("batch");
    assert_eq!(outcome.decisions.len(), 40);
    assert!(outcome.decisions.iter().all(|d| d.je_id.is_some()));
    // Route totality: review decisions carry exactly one reason.
    for decision in &outcome.decisions {
        match decision.route {
            Route::Review => assert!(decision.reason.is_some()),
            Route::AutoPost => assert_eq!(decision.reason, None),
        }
    }
}
