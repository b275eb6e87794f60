//! Per-run evaluation: reset, patch, test, grade.

pub mod pipeline;

pub use pipeline::{EvaluationPipeline, PipelineConfig};
