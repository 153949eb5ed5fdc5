#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Structured LLM adjudication for uncertain decisions. Every call is
//! budgeted and deadlined; any failure degrades to a zero-score signal
//! rather than an error, and a deterministic rule match can never be
//! overridden from here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use tally_journal::AccountCode;
use tally_journal::AccountType;
use tally_journal::Clock;
use tally_journal::TenantId;

mod budget;

pub use budget::BudgetDecision;
pub use budget::BudgetLedger;
pub use budget::GlobalBudget;

#[derive(Debug, Error)]
pub enum LlmFailure {
    #[error("llm call timed out")]
    Timeout,
    #[error("llm backend unavailable: {0}")]
    Unavailable(String),
    #[error("llm returned malformed content: {0}")]
    Malformed(String),
}

/// Chart-of-accounts entry shipped with the request so the model can
/// only answer in known codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoaEntry {
    pub code: AccountCode,
    pub name: String,
    pub account_type: AccountType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalMapping {
    pub vendor_norm: String,
    pub account_code: AccountCode,
    pub confirmations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationRequest {
    pub tenant_id: TenantId,
    pub posted_at: NaiveDate,
    pub amount_minor: i64,
    pub currency: String,
    pub description_norm: String,
    pub counterparty_norm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub accounts: Vec<CoaEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub historical: Vec<HistoricalMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationResponse {
    pub account_code: AccountCode,
    pub score: f64,
    pub rationale: String,
    pub needs_review: bool,
}

/// Completion backend seam. Implementations should respect `deadline`
/// themselves; the adjudicator enforces it regardless.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(
        &self,
        request: &AdjudicationRequest,
        deadline: Duration,
    ) -> Result<AdjudicationResponse, LlmFailure>;
}

/// What the blender receives. `degraded` carries the reason whenever the
/// score was forced to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSignal {
    pub account_code: Option<AccountCode>,
    pub score: f64,
    pub rationale: Option<String>,
    pub needs_review: bool,
    pub degraded: Option<String>,
}

impl LlmSignal {
    fn zero(reason: &str) -> Self {
        Self {
            account_code: None,
            score: 0.0,
            rationale: None,
            needs_review: false,
            degraded: Some(reason.to_owned()),
        }
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LlmConfig {
    pub deadline: Duration,
    /// Flat per-call cost estimate debited against the ledgers.
    pub estimated_cost_microcents: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            estimated_cost_microcents: 2_000,
        }
    }
}

pub struct LlmAdjudicator {
    client: Arc<dyn LLMClient>,
    budget: Arc<BudgetLedger>,
    clock: Arc<dyn Clock>,
    config: LlmConfig,
}

impl LlmAdjudicator {
    pub fn new(
        client: Arc<dyn LLMClient>,
        budget: Arc<BudgetLedger>,
        clock: Arc<dyn Clock>,
        config: LlmConfig,
    ) -> Self {
        Self {
            client,
            budget,
            clock,
            config,
        }
    }

    /// Runs one adjudication. Never blocks on an exhausted budget and
    /// never propagates a failure: the worst outcome is a zero signal
    /// with the reason recorded.
    pub async fn adjudicate(
        &self,
        tenant_call_cap: u64,
        tenant_cost_cap_microcents: u64,
        request: &AdjudicationRequest,
    ) -> LlmSignal {
        let today = self.clock.now().date_naive();
        let decision = self.budget.debit_if_available(
            &request.tenant_id,
            today,
            tenant_call_cap,
            tenant_cost_cap_microcents,
            self.config.estimated_cost_microcents,
        );
        if decision != BudgetDecision::Debited {
            debug!(tenant = request.tenant_id.as_str(), ?decision, "llm budget exhausted");
            return LlmSignal::zero("budget_fallback");
        }

        let call = self.client.complete(request, self.config.deadline);
        let response = match tokio::time::timeout(self.config.deadline, call).await {
            Err(_) => {
                warn!(tenant = request.tenant_id.as_str(), "llm deadline expired");
                return LlmSignal::zero("llm_timeout");
            }
            Ok(Err(LlmFailure::Timeout)) => {
                warn!(tenant = request.tenant_id.as_str(), "llm reported timeout");
                return LlmSignal::zero("llm_timeout");
            }
            Ok(Err(failure)) => {
                warn!(tenant = request.tenant_id.as_str(), %failure, "llm degraded");
                return LlmSignal::zero("llm_unavailable");
            }
            Ok(Ok(response)) => response,
        };

        // An unknown account code is a malformed answer, not a signal.
        if !request
            .accounts
            .iter()
            .any(|entry| entry.code == response.account_code)
        {
            warn!(
                account = response.account_code.as_str(),
                "llm answered outside the chart of accounts"
            );
            return LlmSignal::zero("llm_unknown_account");
        }

        LlmSignal {
            account_code: Some(response.account_code),
            score: response.score.clamp(0.0, 1.0),
            rationale: Some(response.rationale),
            needs_review: response.needs_review,
            degraded: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tally_journal::ManualClock;

    struct FixedClient {
        response: AdjudicationResponse,
    }

    #[async_trait]
    impl LLMClient for FixedClient {
        async fn complete(
            &self,
            _request: &AdjudicationRequest,
            _deadline: Duration,
        ) -> Result<AdjudicationResponse, LlmFailure> {
            Ok(self.response.clone())
        }
    }

    struct HangingClient;

    #[async_trait]
    impl LLMClient for HangingClient {
        async fn complete(
            &self,
            _request: &AdjudicationRequest,
            _deadline: Duration,
        ) -> Result<AdjudicationResponse, LlmFailure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(LlmFailure::Timeout)
        }
    }

    fn clock() -> Arc<ManualClock> {
        let start = chrono::DateTime::parse_from_rfc3339("2025-10-20T08:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&chrono::Utc);
        Arc::new(ManualClock::at(start))
    }

    fn request() -> AdjudicationRequest {
        AdjudicationRequest {
            tenant_id: "tenant-1".into(),
            posted_at: NaiveDate::from_ymd_opt(2025, 10, 15).expect("valid date"),
            amount_minor: -1245,
            currency: "USD".into(),
            description_norm: "amzn mktp us".into(),
            counterparty_norm: "amazon".into(),
            memo: None,
            accounts: vec![
                CoaEntry {
                    code: "6100".into(),
                    name: "Supplies".into(),
                    account_type: AccountType::Expense,
                },
                CoaEntry {
                    code: "1000".into(),
                    name: "Cash".into(),
                    account_type: AccountType::Asset,
                },
            ],
            historical: vec![HistoricalMapping {
                vendor_norm: "amazon".into(),
                account_code: "6100".into(),
                confirmations: 4,
            }],
        }
    }

    fn response(account: &str, score: f64) -> AdjudicationResponse {
        AdjudicationResponse {
            account_code: account.into(),
            score,
            rationale: "recurring marketplace supplier".into(),
            needs_review: false,
        }
    }

    #[tokio::test]
    async fn successful_adjudication_returns_signal() {
        let adjudicator = LlmAdjudicator::new(
            Arc::new(FixedClient {
                response: response("6100", 0.83),
            }),
            Arc::new(BudgetLedger::new(GlobalBudget::default())),
            clock(),
            LlmConfig::default(),
        );
        let signal = adjudicator.adjudicate(100, 1_000_000, &request()).await;
        assert_eq!(signal.account_code.as_deref(), Some("6100"));
        assert_eq!(signal.score, 0.83);
        assert!(!signal.is_degraded());
    }

    #[tokio::test]
    async fn exhausted_tenant_budget_short_circuits() {
        let adjudicator = LlmAdjudicator::new(
            Arc::new(FixedClient {
                response: response("6100", 0.83),
            }),
            Arc::new(BudgetLedger::new(GlobalBudget::default())),
            clock(),
            LlmConfig::default(),
        );
        // Cap of one call: the second must fall back without blocking.
        let first = adjudicator.adjudicate(1, 1_000_000, &request()).await;
        assert!(!first.is_degraded());
        let second = adjudicator.adjudicate(1, 1_000_000, &request()).await;
        assert_eq!(second.score, 0.0);
        assert_eq!(second.degraded.as_deref(), Some("budget_fallback"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_degrades_to_timeout() {
        let adjudicator = LlmAdjudicator::new(
            Arc::new(HangingClient),
            Arc::new(BudgetLedger::new(GlobalBudget::default())),
            clock(),
            LlmConfig {
                deadline: Duration::from_millis(50),
                ..LlmConfig::default()
            },
        );
        let signal = adjudicator.adjudicate(100, 1_000_000, &request()).await;
        assert_eq!(signal.score, 0.0);
        assert_eq!(signal.degraded.as_deref(), Some("llm_timeout"));
    }

    #[tokio::test]
    async fn out_of_chart_answer_is_discarded() {
        let adjudicator = LlmAdjudicator::new(
            Arc::new(FixedClient {
                response: response("9999", 0.95),
            }),
            Arc::new(BudgetLedger::new(GlobalBudget::default())),
            clock(),
            LlmConfig::default(),
        );
        let signal = adjudicator.adjudicate(100, 1_000_000, &request()).await;
        assert_eq!(signal.score, 0.0);
        assert_eq!(signal.degraded.as_deref(), Some("llm_unknown_account"));
    }

    #[tokio::test]
    async fn scores_are_clamped_to_unit_interval() {
        let adjudicator = LlmAdjudicator::new(
            Arc::new(FixedClient {
                response: response("6100", 1.7),
            }),
            Arc::new(BudgetLedger::new(GlobalBudget::default())),
            clock(),
            LlmConfig::default(),
        );
        let signal = adjudicator.adjudicate(100, 1_000_000, &request()).await;
        assert_eq!(signal.score, 1.0);
    }
}
