use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::AccountCode;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("blend weights must each sit in [0,1] and sum to 1.0, got {0}")]
    InvalidWeights(f64),
    #[error("uncertain band must satisfy 0 <= low < high <= 1, got [{low}, {high}]")]
    InvalidBand { low: f64, high: f64 },
    #[error("validation error: {0}")]
    Validation(String),
}

/// Relative weight of each signal in the blender. Validated once at
/// startup; the pipeline refuses to run on an invalid set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    pub rules: f64,
    pub ml: f64,
    pub llm: f64,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            rules: 0.5,
            ml: 0.35,
            llm: 0.15,
        }
    }
}

impl BlendWeights {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let in_range =
            |w: f64| (0.0..=1.0).contains(&w);
        let sum = self.rules + self.ml + self.llm;
        if !in_range(self.rules) || !in_range(self.ml) || !in_range(self.llm) {
            return Err(SettingsError::InvalidWeights(sum));
        }
        if (sum - 1.0).abs() > 1e-9 {
            return Err(SettingsError::InvalidWeights(sum));
        }
        Ok(())
    }
}

/// Blend-score interval in which the LLM adjudicator is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertainBand {
    pub low: f64,
    pub high: f64,
}

impl Default for UncertainBand {
    fn default() -> Self {
        Self {
            low: 0.60,
            high: 0.85,
        }
    }
}

impl UncertainBand {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.low < 0.0 || self.high > 1.0 || self.low >= self.high {
            return Err(SettingsError::InvalidBand {
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, score: f64) -> bool {
        score >= self.low && score <= self.high
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Calibrated probability a decision must clear to auto-post.
    pub confidence_threshold: f64,
    /// Consistent confirmations a vendor needs before leaving cold start.
    pub cold_start_min: usize,
    pub autopost_enabled: bool,
    pub anomaly_blocks_autopost: bool,
    /// Width of the robust z-band, in MAD multiples.
    pub anomaly_mad_k: f64,
    pub blend_weights: BlendWeights,
    pub llm_band: UncertainBand,
    pub llm_daily_call_cap: u64,
    pub llm_daily_cost_cap_microcents: u64,
    pub date_tolerance_days: i64,
    /// Fraction of a dry-run sample allowed to change account before the
    /// impact report flags the version.
    pub dry_run_reclass_threshold: f64,
    /// Ingestion source file id -> CoA cash account code.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cash_account_by_source: HashMap<String, AccountCode>,
    /// Fallback cash account when a source file has no explicit mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cash_account: Option<AccountCode>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.90,
            cold_start_min: 3,
            autopost_enabled: false,
            anomaly_blocks_autopost: true,
            anomaly_mad_k: 6.0,
            blend_weights: BlendWeights::default(),
            llm_band: UncertainBand::default(),
            llm_daily_call_cap: 500,
            llm_daily_cost_cap_microcents: 5_000_000,
            date_tolerance_days: 3,
            dry_run_reclass_threshold: 0.005,
            cash_account_by_source: HashMap::new(),
            default_cash_account: None,
        }
    }
}

impl TenantSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(SettingsError::Validation(format!(
                "confidence_threshold {} outside [0,1]",
                self.confidence_threshold
            )));
        }
        if self.anomaly_mad_k <= 0.0 {
            return Err(SettingsError::Validation(
                "anomaly_mad_k must be positive".into(),
            ));
        }
        if self.date_tolerance_days < 0 {
            return Err(SettingsError::Validation(
                "date_tolerance_days cannot be negative".into(),
            ));
        }
        self.blend_weights.validate()?;
        self.llm_band.validate()?;
        Ok(())
    }

    #[must_use]
    pub fn cash_account_for(&self, source_file_id: &str) -> Option<&AccountCode> {
        self.cash_account_by_source
            .get(source_file_id)
            .or(self.default_cash_account.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(TenantSettings::default().validate().is_ok());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let weights = BlendWeights {
            rules: 0.5,
            ml: 0.5,
            llm: 0.5,
        };
        assert!(weights.validate().is_err());

        let weights = BlendWeights {
            rules: 0.2,
            ml: 0.5,
            llm: 0.3,
        };
        assert!(weights.validate().is_ok());
    }

    #[test]
    fn band_bounds_are_checked() {
        let band = UncertainBand { low: 0.9, high: 0.6 };
        assert!(band.validate().is_err());

        let band = UncertainBand::default();
        assert!(band.contains(0.60));
        assert!(band.contains(0.85));
        assert!(!band.contains(0.86));
    }

    #[test]
    fn cash_account_falls_back_to_default() {
        let mut settings = TenantSettings::default();
        settings
            .cash_account_by_source
            .insert("upload-1".into(), "1000".into());
        settings.default_cash_account = Some("1010".into());

        assert_eq!(
            settings.cash_account_for("upload-1").map(String::as_str),
            Some("1000")
        );
        assert_eq!(
            settings.cash_account_for("upload-9").map(String::as_str),
            Some("1010")
        );
    }
}
