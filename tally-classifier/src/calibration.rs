//! Probability calibration for the classifier's argmax score. Isotonic
//! regression (pool-adjacent-violators) is the default; temperature
//! scaling on the logit is the cheaper alternative.

use chrono::DateTime;
use chrono::Utc;

use tally_journal::CalibrationMethod;
use tally_journal::CalibrationModel;
use tally_journal::CalibrationParameters;
use tally_journal::ModelVersionId;

use crate::ClassifierError;
use crate::ClassifierResult;

fn default_bin_edges() -> Vec<f64> {
    (0..=10).map(|i| f64::from(i) / 10.0).collect()
}

/// Mean squared gap between calibrated score and outcome.
#[must_use]
pub fn brier_score(pairs: &[(f64, bool)]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    pairs
        .iter()
        .map(|(p, correct)| {
            let y = if *correct { 1.0 } else { 0.0 };
            (p - y) * (p - y)
        })
        .sum::<f64>()
        / pairs.len() as f64
}

fn bin_index(p: f64, edges: &[f64]) -> usize {
    let bins = edges.len().saturating_sub(1).max(1);
    let clamped = p.clamp(0.0, 1.0);
    ((clamped * bins as f64).floor() as usize).min(bins - 1)
}

/// Per-bin |mean predicted - observed accuracy|; empty bins report 0.
#[must_use]
pub fn per_bin_gaps(pairs: &[(f64, bool)], edges: &[f64]) -> Vec<f64> {
    let bins = edges.len().saturating_sub(1).max(1);
    let mut sums = vec![0.0_f64; bins];
    let mut hits = vec![0.0_f64; bins];
    let mut counts = vec![0_usize; bins];
    for (p, correct) in pairs {
        let bin = bin_index(*p, edges);
        sums[bin] += p;
        if *correct {
            hits[bin] += 1.0;
        }
        counts[bin] += 1;
    }
    (0..bins)
        .map(|bin| {
            if counts[bin] == 0 {
                0.0
            } else {
                let mean_pred = sums[bin] / counts[bin] as f64;
                let observed = hits[bin] / counts[bin] as f64;
                (mean_pred - observed).abs()
            }
        })
        .collect()
}

/// Count-weighted mean of the per-bin gaps.
#[must_use]
pub fn expected_calibration_error(pairs: &[(f64, bool)], edges: &[f64]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let bins = edges.len().saturating_sub(1).max(1);
    let mut counts = vec![0_usize; bins];
    for (p, _) in pairs {
        counts[bin_index(*p, edges)] += 1;
    }
    per_bin_gaps(pairs, edges)
        .iter()
        .zip(counts.iter())
        .map(|(gap, count)| gap * *count as f64)
        .sum::<f64>()
        / pairs.len() as f64
}

/// Applies a fitted calibration model to one raw argmax probability.
#[must_use]
pub fn apply_calibration(model: &CalibrationModel, raw_p: f64) -> f64 {
    let p = raw_p.clamp(0.0, 1.0);
    match &model.parameters {
        CalibrationParameters::Isotonic { thresholds, values } => {
            if thresholds.is_empty() {
                return p;
            }
            let index = thresholds
                .iter()
                .position(|threshold| p <= *threshold)
                .unwrap_or(thresholds.len() - 1);
            values.get(index).copied().unwrap_or(p).clamp(0.0, 1.0)
        }
        CalibrationParameters::Temperature { t } => {
            if *t <= 0.0 {
                return p;
            }
            // Logistic temperature scaling; logit saturates at the ends.
            let clamped = p.clamp(1e-9, 1.0 - 1e-9);
            let logit = (clamped / (1.0 - clamped)).ln();
            1.0 / (1.0 + (-logit / t).exp())
        }
    }
}

fn build_model(
    pairs: &[(f64, bool)],
    method: CalibrationMethod,
    parameters: CalibrationParameters,
    model_version_id: &ModelVersionId,
    trained_at: DateTime<Utc>,
) -> CalibrationModel {
    let edges = default_bin_edges();
    let mut model = CalibrationModel {
        model_version_id: model_version_id.clone(),
        method,
        parameters,
        trained_at,
        ece: 0.0,
        brier: 0.0,
        bin_edges: edges.clone(),
    };
    let calibrated: Vec<(f64, bool)> = pairs
        .iter()
        .map(|(p, correct)| (apply_calibration(&model, *p), *correct))
        .collect();
    model.ece = expected_calibration_error(&calibrated, &edges);
    model.brier = brier_score(&calibrated);
    model
}

/// Pool-adjacent-violators over (raw score, correctness), producing a
/// monotone step function.
pub fn fit_isotonic(
    pairs: &[(f64, bool)],
    model_version_id: &ModelVersionId,
    trained_at: DateTime<Utc>,
) -> ClassifierResult<CalibrationModel> {
    if pairs.len() < 10 {
        return Err(ClassifierError::Training(format!(
            "isotonic fit needs at least 10 validation points, got {}",
            pairs.len()
        )));
    }
    let mut sorted: Vec<(f64, f64)> = pairs
        .iter()
        .map(|(p, correct)| (p.clamp(0.0, 1.0), if *correct { 1.0 } else { 0.0 }))
        .collect();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Blocks of (weight, value sum, max raw score).
    struct Block {
        weight: f64,
        sum: f64,
        upper: f64,
    }
    let mut blocks: Vec<Block> = Vec::new();
    for (score, target) in sorted {
        blocks.push(Block {
            weight: 1.0,
            sum: target,
            upper: score,
        });
        while blocks.len() >= 2 {
            let last = blocks.len() - 1;
            let prev_mean = blocks[last - 1].sum / blocks[last - 1].weight;
            let last_mean = blocks[last].sum / blocks[last].weight;
            if prev_mean <= last_mean {
                break;
            }
            let merged = Block {
                weight: blocks[last - 1].weight + blocks[last].weight,
                sum: blocks[last - 1].sum + blocks[last].sum,
                upper: blocks[last].upper,
            };
            blocks.truncate(last - 1);
            blocks.push(merged);
        }
    }

    let mut thresholds = Vec::with_capacity(blocks.len());
    let mut values = Vec::with_capacity(blocks.len());
    for block in &blocks {
        thresholds.push(block.upper);
        values.push((block.sum / block.weight).clamp(0.0, 1.0));
    }
    // Open the last segment so scores above the highest seen raw value
    // still calibrate.
    if let Some(last) = thresholds.last_mut() {
        *last = last.max(1.0);
    }

    Ok(build_model(
        pairs,
        CalibrationMethod::Isotonic,
        CalibrationParameters::Isotonic { thresholds, values },
        model_version_id,
        trained_at,
    ))
}

/// Grid-searched logistic temperature minimizing NLL on the validation
/// pairs.
pub fn fit_temperature(
    pairs: &[(f64, bool)],
    model_version_id: &ModelVersionId,
    trained_at: DateTime<Utc>,
) -> ClassifierResult<CalibrationModel> {
    if pairs.len() < 10 {
        return Err(ClassifierError::Training(format!(
            "temperature fit needs at least 10 validation points, got {}",
            pairs.len()
        )));
    }
    let nll = |t: f64| -> f64 {
        let probe = CalibrationModel {
            model_version_id: model_version_id.clone(),
            method: CalibrationMethod::Temperature,
            parameters: CalibrationParameters::Temperature { t },
            trained_at,
            ece: 0.0,
            brier: 0.0,
            bin_edges: Vec::new(),
        };
        pairs
            .iter()
            .map(|(p, correct)| {
                let calibrated = apply_calibration(&probe, *p).clamp(1e-9, 1.0 - 1e-9);
                if *correct {
                    -calibrated.ln()
                } else {
                    -(1.0 - calibrated).ln()
                }
            })
            .sum()
    };

    let mut best_t = 1.0;
    let mut best_nll = f64::INFINITY;
    let mut t = 0.25;
    while t <= 4.0 + 1e-9 {
        let loss = nll(t);
        if loss < best_nll {
            best_nll = loss;
            best_t = t;
        }
        t += 0.05;
    }

    Ok(build_model(
        pairs,
        CalibrationMethod::Temperature,
        CalibrationParameters::Temperature { t: best_t },
        model_version_id,
        trained_at,
    ))
}
