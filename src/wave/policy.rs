/// Raw shape metrics, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeMetrics {
    pub curl: f64,
    pub divergence: f64,
    pub potential: f64,
}

/// Folds shape metrics into a `[0, 100]` score.
///
/// Implementations must be non-increasing in curl and divergence and
/// non-decreasing in potential; repetition tests depend on it.
pub trait ScoringPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, metrics: &ShapeMetrics) -> f64;
}

/// `100 × (1 − curl) × (1 − divergence) × (1 + potential) / 2`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductPolicy;

impl ScoringPolicy for ProductPolicy {
    fn name(&self) -> &'static str {
        "product"
    }

    fn score(&self, metrics: &ShapeMetrics) -> f64 {
        let raw = 100.0
            * (1.0 - metrics.curl)
            * (1.0 - metrics.divergence)
            * (1.0 + metrics.potential)
            / 2.0;
        raw.clamp(0.0, 100.0)
    }
}
