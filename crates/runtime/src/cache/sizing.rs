use std::sync::Arc;

use strata_common::config::SizeEstimation;

use crate::types::{row_size, Row};

/// Computes the approximate footprint of rows entering the cache.
pub trait SizeEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate_rows(&self, rows: &[Row]) -> usize;
}

/// Sums every row.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactEstimator;

impl SizeEstimator for ExactEstimator {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn estimate_rows(&self, rows: &[Row]) -> usize {
        rows.iter().map(row_size).sum()
    }
}

/// Measures an evenly spaced sample and scales it to the whole run.
#[derive(Debug, Clone, Copy)]
pub struct ApproximateEstimator {
    pub sample_rows: usize,
}

impl Default for ApproximateEstimator {
    fn default() -> Self {
        Self { sample_rows: 16 }
    }
}

impl SizeEstimator for ApproximateEstimator {
    fn name(&self) -> &'static str {
        "approximate"
    }

    fn estimate_rows(&self, rows: &[Row]) -> usize {
        let sample = self.sample_rows.max(1);
        if rows.len() <= sample {
            return rows.iter().map(row_size).sum();
        }
        let step = rows.len() / sample;
        let sampled: usize = rows.iter().step_by(step).take(sample).map(row_size).sum();
        sampled * rows.len() / sample
    }
}

pub fn estimator_for(mode: SizeEstimation) -> Arc<dyn SizeEstimator> {
    match mode {
        SizeEstimation::Approximate => Arc::new(ApproximateEstimator::default()),
        SizeEstimation::Exact => Arc::new(ExactEstimator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_uniform_rows_estimate_matches_exact() {
        let rows: Vec<Row> = (0..1000)
            .map(|i| vec![Value::Int64(i), Value::from("abcdefgh")])
            .collect();
        let exact = ExactEstimator.estimate_rows(&rows);
        let approx = ApproximateEstimator::default().estimate_rows(&rows);
        assert_eq!(exact, approx);
    }

    #[test]
    fn test_small_inputs_are_measured_fully() {
        let rows: Vec<Row> = vec![vec![Value::from("x".repeat(100))], vec![Value::Null]];
        assert_eq!(
            ApproximateEstimator::default().estimate_rows(&rows),
            ExactEstimator.estimate_rows(&rows)
        );
        assert_eq!(ExactEstimator.estimate_rows(&[]), 0);
    }

    #[test]
    fn test_estimator_for_config() {
        assert_eq!(estimator_for(SizeEstimation::Exact).name(), "exact");
        assert_eq!(estimator_for(SizeEstimation::Approximate).name(), "approximate");
    }
}
