pub mod config;
pub mod engine;
pub mod filtergraph;
pub mod pipeline;
pub mod sampler;
pub mod search;
pub mod similarity;
pub mod synth;

pub use pipeline::{LoopError, LoopPlan, LoopRequest, PointSource};
pub use search::{LoopMatch, LoopPoint};

/// Application name for XDG paths and scratch directories
pub const APP_NAME: &str = "vidloop";
