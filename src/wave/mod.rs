pub mod analyzer;
pub mod policy;
pub mod service;
pub mod text;

pub use analyzer::{CoherenceAnalyzer, WaveMetrics};
pub use policy::{ProductPolicy, ScoringPolicy, ShapeMetrics};
pub use service::{AnalyzeRequest, WaveAnalysis, WaveService};
