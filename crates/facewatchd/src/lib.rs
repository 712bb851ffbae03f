//! facewatch daemon library: configuration, the per-stream identification
//! pipeline, and the HTTP surface that drives it.

pub mod config;
pub mod consumer;
pub mod http;
pub mod pipeline;

pub use config::{default_data_dir, Config, ConfigError};
pub use consumer::{ChannelConsumer, ConsumerGone, FrameConsumer};
pub use http::{router, AppState};
pub use pipeline::{
    AnalyzerFactory, OnnxModels, Pipeline, PipelineError, PipelineParams, PipelineReport, PipelineState,
    SourceOpener, SystemSources,
};
