use serde::Deserialize;
use serde::Serialize;

use crate::AccountCode;
use crate::ModelVersionId;
use crate::NotAutoPostReason;
use crate::RuleId;
use crate::RuleMatchType;
use crate::RuleVersionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Rules,
    Ml,
    Llm,
}

/// One contribution to a decision. Fixed variant set; free-form payloads
/// never enter the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum TraceSignal {
    Rule {
        rule_id: RuleId,
        match_type: RuleMatchType,
        pattern: String,
        account_code: AccountCode,
        score: f64,
    },
    Ml {
        model_version_id: ModelVersionId,
        account_code: AccountCode,
        score: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        calibrated_p: Option<f64>,
    },
    Llm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account_code: Option<AccountCode>,
        score: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        degraded: Option<String>,
    },
    System {
        note: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<TraceSignal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_norm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_version_id: Option<RuleVersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<ModelVersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_method: Option<String>,
    /// Every reason the gate observed, in evaluation order. The entry's
    /// `review_reason` is the first of these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<NotAutoPostReason>,
}

impl DecisionTrace {
    #[must_use]
    pub fn system(note: String) -> Self {
        Self {
            signals: vec![TraceSignal::System { note }],
            ..Self::default()
        }
    }

    pub fn push(&mut self, signal: TraceSignal) {
        self.signals.push(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn trace_signals_serialize_tagged() {
        let trace = DecisionTrace {
            signals: vec![
                TraceSignal::Rule {
                    rule_id: "rule-1".into(),
                    match_type: RuleMatchType::Exact,
                    pattern: "amazon".into(),
                    account_code: "6100".into(),
                    score: 1.0,
                },
                TraceSignal::Llm {
                    account_code: None,
                    score: 0.0,
                    rationale: None,
                    degraded: Some("llm_timeout".into()),
                },
            ],
            vendor_norm: Some("amazon".into()),
            rule_version_id: Some("v-20251015".into()),
            model_version_id: None,
            calibration_method: None,
            reasons: vec![],
        };

        let json = serde_json::to_value(&trace).expect("serialize");
        assert_eq!(json["signals"][0]["signal"], "rule");
        assert_eq!(json["signals"][1]["signal"], "llm");
        assert_eq!(json["signals"][1]["degraded"], "llm_timeout");

        let back: DecisionTrace = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, trace);
    }
}
