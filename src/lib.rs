
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod effects;
pub mod error;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod selection;
pub mod simulate;

use tracing::*;

pub use config::AnalysisConfig;
pub use data::{Observation, Partition, PreparedDataset, Response};
pub use diagnostics::{DiagnosticsChecker, DiagnosticsReport};
pub use effects::{EffectExtractor, EffectTable, PredictionCurve};
pub use error::AnalysisError;
pub use model::{Fitter, FittedModel, ModelSpec, NegBinFitter};
pub use pipeline::{AnalysisReport, Pipeline, RunReport};
pub use selection::{CandidateSet, ModelSelector};

/// Objects that can be recorded in the log
pub trait Loggable {
    fn log( &self, message: &str, level: tracing::Level );
}

/// Emits a message at a level chosen at runtime
pub fn log_at( level: Level, message: &str ) {
    match level {
	Level::ERROR => error!( "{message}" ),
	Level::WARN => warn!( "{message}" ),
	Level::INFO => info!( "{message}" ),
	Level::DEBUG => debug!( "{message}" ),
	_ => trace!( "{message}" ),
    }
}
