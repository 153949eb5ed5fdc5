//! Weighted fusion of the three decision signals.

use std::collections::BTreeMap;

use tally_journal::AccountCode;
use tally_journal::BlendWeights;
use tally_journal::SignalKind;

/// One signal's suggestion: which account, how strongly.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalScore {
    pub account_code: Option<AccountCode>,
    pub score: f64,
}

impl SignalScore {
    #[must_use]
    pub fn none() -> Self {
        Self {
            account_code: None,
            score: 0.0,
        }
    }

    #[must_use]
    pub fn suggest(account_code: &AccountCode, score: f64) -> Self {
        Self {
            account_code: Some(account_code.clone()),
            score: score.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlendOutcome {
    pub account_code: Option<AccountCode>,
    pub blend_score: f64,
    /// Every account any signal suggested, with its fused score.
    pub per_account: Vec<(AccountCode, f64)>,
}

/// `blend[account] = Σ w_i · score_i · 1{signal_i.account == account}`.
/// Ties break toward the account backed by the heaviest signal, then the
/// lowest account code.
#[must_use]
pub fn blend(
    weights: &BlendWeights,
    rules: &SignalScore,
    ml: &SignalScore,
    llm: &SignalScore,
) -> BlendOutcome {
    let contributions: [(&SignalScore, f64, SignalKind); 3] = [
        (rules, weights.rules, SignalKind::Rules),
        (ml, weights.ml, SignalKind::Ml),
        (llm, weights.llm, SignalKind::Llm),
    ];

    let mut fused: BTreeMap<&AccountCode, f64> = BTreeMap::new();
    for (signal, weight, _) in &contributions {
        if let Some(account) = &signal.account_code {
            *fused.entry(account).or_insert(0.0) += weight * signal.score;
        }
    }
    if fused.is_empty() {
        return BlendOutcome {
            account_code: None,
            blend_score: 0.0,
            per_account: Vec::new(),
        };
    }

    let best_score = fused.values().copied().fold(f64::NEG_INFINITY, f64::max);
    let tied: Vec<&AccountCode> = fused
        .iter()
        .filter(|(_, score)| (**score - best_score).abs() < 1e-12)
        .map(|(account, _)| *account)
        .collect();

    let winner: AccountCode = if tied.len() == 1 {
        tied[0].clone()
    } else {
        // A tied account backed by a heavier signal wins; a full tie
        // falls through to the lowest account code.
        tied.iter()
            .map(|account| {
                let backing = contributions
                    .iter()
                    .filter(|(signal, _, _)| signal.account_code.as_ref() == Some(*account))
                    .map(|(_, weight, _)| *weight)
                    .fold(0.0, f64::max);
                (*account, backing)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(account, _)| account.clone())
            .unwrap_or_else(|| tied[0].clone())
    };

    BlendOutcome {
        account_code: Some(winner.clone()),
        blend_score: fused.get(&winner).copied().unwrap_or(0.0),
        per_account: fused
            .into_iter()
            .map(|(account, score)| (account.clone(), score))
            .collect(),
    }
}
