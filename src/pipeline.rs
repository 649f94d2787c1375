
use serde::Serialize;
use tracing::*;

use crate::*;
use crate::config::{AnalysisConfig, Standardization};
use crate::data::{BeforeAfter, Observation, Partition, PreparedDataset, Response};
use crate::diagnostics::{DiagnosticsChecker, DiagnosticsReport};
use crate::effects::{EffectExtractor, EffectRow, EffectTable, PredictionCurve, PredictionGrid, PredictionRow};
use crate::error::{AnalysisError, Result};
use crate::model::{Fitter, FitStatus, FittedModel, ModelSpec, NegBinFitter, Scored, Term};
use crate::selection::{CandidateSet, ModelSelector};

/// What is reported of a fitted model
#[derive( Debug, Clone, Serialize )]
pub struct ModelSummary {
    pub formula: String,
    pub n_obs: usize,
    pub n_parameters: usize,
    pub log_likelihood: f64,
    pub aic: f64,
    pub aicc: f64,
    pub random_sd: f64,
    pub theta: f64,
    pub status: FitStatus,
    pub aliased: Vec<String>,
    pub random_effects: Vec<(String, f64)>,
}

/// Everything one (response, partition) run produced
#[derive( Debug, Clone, Serialize )]
pub struct RunReport {
    pub response: Response,
    pub partition: String,
    pub rows: usize,
    /// terms removed by collinearity pruning before selection
    pub pruned: Vec<String>,
    pub full_model: ModelSummary,
    pub full_diagnostics: DiagnosticsReport,
    pub selection: CandidateSet,
    pub final_model: ModelSummary,
    pub final_diagnostics: DiagnosticsReport,
    pub coefficients: EffectTable,
    pub predictions: PredictionCurve,
}

#[derive( Debug, Clone, Serialize )]
pub struct RunFailure {
    pub response: Response,
    pub partition: String,
    pub error: String,
}

/// Candidate row tagged with its run, for the combined table
#[derive( Debug, Clone, Serialize )]
pub struct CandidateRow {
    pub response: Response,
    pub partition: String,
    pub terms: String,
    pub aicc: f64,
    pub delta: f64,
    pub log_likelihood: f64,
    pub n_parameters: usize,
    pub converged: bool,
    pub supported: bool,
}

#[derive( Debug, Clone, Default, Serialize )]
pub struct AnalysisReport {
    pub runs: Vec<RunReport>,
    pub failures: Vec<RunFailure>,
}

/// prepare, fit the full model, diagnose, select, refit the best term set, diagnose and extract effects
pub struct Pipeline {
    config: AnalysisConfig,
    observations: Vec<(usize, Observation)>,
    /// all rows prepared once, for global standardization
    prepared: Option<PreparedDataset>,
    fitter: NegBinFitter,
    checker: DiagnosticsChecker,
    extractor: EffectExtractor,
    grids: Vec<PredictionGrid>,
}

impl From<&FittedModel> for ModelSummary {
    fn from( model: &FittedModel ) -> Self {
	ModelSummary{
	    formula: model.spec.label(),
	    n_obs: model.n_obs(),
	    n_parameters: model.n_parameters(),
	    log_likelihood: model.log_likelihood(),
	    aic: model.aic(),
	    aicc: model.aicc(),
	    random_sd: model.random_sd,
	    theta: model.theta,
	    status: model.status.clone(),
	    aliased: model.layout.aliased.clone(),
	    random_effects: model.random_effects.clone(),
	}
    }
}

impl Pipeline {
    /// Checks the configuration and, for global standardization, prepares all observations
    pub fn new( config: AnalysisConfig, observations: Vec<(usize, Observation)> ) -> Result<Pipeline> {
	config.validate()?;
	let prepared = match config.standardization {
	    Standardization::Global => Some( config.preparer()?.prepare( &observations )? ),
	    Standardization::PerPartition => None,
	};
	Ok( Pipeline{
	    fitter: NegBinFitter::new( config.fitter_config() ),
	    checker: DiagnosticsChecker::default(),
	    extractor: EffectExtractor::new( config.confidence ),
	    grids: config.prediction_grids()?,
	    config,
	    observations,
	    prepared,
	})
    }

    pub fn config( &self ) -> &AnalysisConfig {
	&self.config
    }

    /// Rows of a partition, standardized as configured
    pub fn dataset( &self, partition: &Partition ) -> Result<PreparedDataset> {
	match &self.prepared {
	    Some( prepared ) => Ok( prepared.partition( partition )),
	    None => {
		let mut rows = Vec::new();
		for (row, observation) in &self.observations {
		    let period = BeforeAfter::from_raw( &observation.fire_period, *row )?;
		    if partition.contains( observation.year(), period ) {
			rows.push( (*row, observation.clone()) );
		    }
		}
		self.config.preparer()?.prepare( &rows )
	    },
	}
    }

    /// One complete analysis of a response on a partition
    pub fn run( &self, response: Response, partition: &Partition ) -> Result<RunReport> {
	let _span = info_span!( "run", response = %response, partition = %partition.name ).entered();
	let data = self.dataset( partition )?;
	info!( "{}: {} rows", partition.describe(), data.len() );

	let mut full = self.config.full_spec( response )?;
	let mut pruned = Vec::new();
	if self.config.prune_collinear {
	    (full, pruned) = self.prune_collinear( &full, &data )?;
	}

	let full_model = self.fitter.fit( &full, &data )?;
	full_model.log( "full model", Level::INFO );
	let full_diagnostics = self.checker.diagnose( &full_model );
	full_diagnostics.log( "full model diagnostics", Level::INFO );

	let selector = ModelSelector::new( self.fitter.clone(), self.config.delta_threshold );
	let selection = selector.select( &full, &data )?;

	let final_model = self.fitter.fit( &selection.best().spec, &data )?;
	final_model.log( "selected model", Level::INFO );
	let final_diagnostics = self.checker.diagnose( &final_model );
	let level = if final_diagnostics.has_warnings() { Level::WARN } else { Level::INFO };
	final_diagnostics.log( "selected model diagnostics", level );

	let coefficients = self.extractor.coefficients( &final_model, self.config.include_intercept ).labelled( &partition.name );
	coefficients.log( "coefficients", Level::DEBUG );
	let mut predictions = PredictionCurve::default();
	for grid in &self.grids {
	    let curve = self.extractor.predict( &final_model, grid, &data )?;
	    predictions.rows.extend( curve.labelled( &partition.name ).rows );
	}

	Ok( RunReport{
	    response,
	    partition: partition.name.clone(),
	    rows: data.len(),
	    pruned,
	    full_model: ModelSummary::from( &full_model ),
	    full_diagnostics,
	    selection,
	    final_model: ModelSummary::from( &final_model ),
	    final_diagnostics,
	    coefficients,
	    predictions,
	})
    }

    /// Every configured response on every configured partition. A failed run is recorded and
    /// the remaining runs go on.
    pub fn run_all( &self ) -> AnalysisReport {
	let mut report = AnalysisReport::default();
	for response in &self.config.responses {
	    for partition in &self.config.partitions {
		match self.run( *response, partition ) {
		    Ok( run ) => report.runs.push( run ),
		    Err( err ) => {
			error!( "{response} on {}: {err}", partition.name );
			report.failures.push( RunFailure{ response: *response, partition: partition.name.clone(), error: err.to_string() });
		    },
		}
	    }
	}
	info!( "{} runs finished, {} failed", report.runs.len(), report.failures.len() );
	report
    }

    /// Repeatedly drops the main effect with the largest flagged GVIF, together with its
    /// interactions, until no main effect is flagged. Interactions are never dropped on their own.
    pub fn prune_collinear( &self, full: &ModelSpec, data: &PreparedDataset ) -> Result<(ModelSpec, Vec<String>)> {
	let _span = info_span!( "prune" ).entered();
	let mut spec = full.clone();
	let mut dropped = Vec::new();
	loop {
	    let model = self.fitter.fit( &spec, data )?;
	    let report = self.checker.diagnose( &model );
	    let worst = report.collinearity.iter()
		.filter( |s| s.flagged )
		.filter_map( |s| match s.term.parse::<Term>() {
		    Ok( Term::Main( covariate ) ) => Some( (covariate, s.adjusted) ),
		    _ => None,
		})
		.max_by( |a, b| a.1.total_cmp( &b.1 ));
	    let Some( (covariate, adjusted) ) = worst else {
		break;
	    };
	    warn!( "dropping {covariate} (GVIF^(1/(2df)) {adjusted:.3}) and its interactions" );
	    dropped.push( covariate.to_string() );
	    spec = spec.without( covariate );
	}
	Ok( (spec, dropped) )
    }
}

impl AnalysisReport {
    pub fn coefficients( &self ) -> Vec<&EffectRow> {
	self.runs.iter().flat_map( |r| r.coefficients.rows.iter() ).collect()
    }

    pub fn predictions( &self ) -> Vec<&PredictionRow> {
	self.runs.iter().flat_map( |r| r.predictions.rows.iter() ).collect()
    }

    pub fn candidates( &self ) -> Vec<CandidateRow> {
	self.runs.iter().flat_map( |run| run.selection.candidates.iter().map( move |c| CandidateRow{
	    response: run.response,
	    partition: run.partition.clone(),
	    terms: c.terms.clone(),
	    aicc: c.aicc,
	    delta: c.delta,
	    log_likelihood: c.log_likelihood,
	    n_parameters: c.n_parameters,
	    converged: c.converged,
	    supported: c.delta <= run.selection.threshold,
	})).collect()
    }

    /// Error out if nothing could be analysed at all
    pub fn ensure_any( &self ) -> Result<()> {
	if self.runs.is_empty() {
	    return Err( AnalysisError::NoSuccessfulRun{ failed: self.failures.len() });
	}
	Ok( () )
    }
}
