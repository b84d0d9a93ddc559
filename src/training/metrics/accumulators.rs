//! Running metric accumulators
//!
//! Updates with empty slices are no-ops, and an accumulator that has seen no
//! values reports `0.0`.

/// A stateful streaming metric over `(real, pred)` pairs
pub trait MetricAccumulator {
    /// Metric name used in reports
    fn name(&self) -> &'static str;

    /// Fold a batch of paired values into the running state
    fn update(&mut self, real: &[f32], pred: &[f32]);

    /// Current value
    fn result(&self) -> f64;

    /// Clear the running state
    fn reset(&mut self);

    /// Number of values folded in since the last reset
    fn count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Running {
    total: f64,
    count: usize,
}

impl Running {
    fn add(&mut self, real: &[f32], pred: &[f32], term: impl Fn(f64, f64) -> f64) {
        debug_assert_eq!(real.len(), pred.len());
        for (&r, &p) in real.iter().zip(pred) {
            self.total += term(r as f64, p as f64);
            self.count += 1;
        }
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// Root mean squared error
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rmse(Running);

impl MetricAccumulator for Rmse {
    fn name(&self) -> &'static str {
        "RMSE"
    }

    fn update(&mut self, real: &[f32], pred: &[f32]) {
        self.0.add(real, pred, |r, p| (r - p).powi(2));
    }

    fn result(&self) -> f64 {
        self.0.mean().sqrt()
    }

    fn reset(&mut self) {
        self.0 = Running::default();
    }

    fn count(&self) -> usize {
        self.0.count
    }
}

/// Mean absolute error
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Mae(Running);

impl MetricAccumulator for Mae {
    fn name(&self) -> &'static str {
        "MAE"
    }

    fn update(&mut self, real: &[f32], pred: &[f32]) {
        self.0.add(real, pred, |r, p| (r - p).abs());
    }

    fn result(&self) -> f64 {
        self.0.mean()
    }

    fn reset(&mut self) {
        self.0 = Running::default();
    }

    fn count(&self) -> usize {
        self.0.count
    }
}

/// Mean absolute percentage error, as a fraction
///
/// Pairs whose ground truth is zero are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Mape(Running);

impl MetricAccumulator for Mape {
    fn name(&self) -> &'static str {
        "MAPE"
    }

    fn update(&mut self, real: &[f32], pred: &[f32]) {
        for (&r, &p) in real.iter().zip(pred) {
            if r != 0.0 {
                self.0.add(&[r], &[p], |r, p| ((r - p) / r).abs());
            }
        }
    }

    fn result(&self) -> f64 {
        self.0.mean()
    }

    fn reset(&mut self) {
        self.0 = Running::default();
    }

    fn count(&self) -> usize {
        self.0.count
    }
}
