#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Drift monitoring and safe retraining. The monitor scores distribution
//! shift between a training-time baseline and the current window; the
//! retrainer shadow-trains a candidate and only promotes it through a
//! fixed set of quality gates.

use thiserror::Error;

use tally_journal::StorageError;

mod monitor;
mod registry;
mod retrain;

pub use monitor::DriftReport;
pub use monitor::DriftThresholds;
pub use monitor::DriftTier;
pub use monitor::DriftWindow;
pub use monitor::TrainState;
pub use monitor::assess_drift;
pub use monitor::js_divergence;
pub use monitor::population_stability_index;
pub use monitor::top_terms;
pub use registry::MODEL_POINTER;
pub use registry::ModelRegistry;
pub use retrain::GateMetrics;
pub use retrain::GateOutcome;
pub use retrain::RetrainOutcome;
pub use retrain::Retrainer;
pub use retrain::RetrainerConfig;
pub use retrain::promotion_gates;
pub use retrain::split_time_respecting;

pub type DriftResult<T> = Result<T, DriftError>;

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("training failure: {0}")]
    Training(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("audit sink failure: {0}")]
    Audit(String),
}
