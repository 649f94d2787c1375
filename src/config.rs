
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::*;

use crate::data::{Covariate, DataPreparer, Factor, Numeric, Partition, Response};
use crate::effects::{GridValue, GridValues, PredictionGrid};
use crate::error::{AnalysisError, Result};
use crate::model::{FitterConfig, ModelSpec, Term};

/// Where z-score parameters come from
#[derive( Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize )]
#[serde( rename_all = "kebab-case" )]
pub enum Standardization {
    /// prepare the full data once, partitions reuse its scaling and levels
    Global,
    /// prepare every partition's rows on their own
    PerPartition,
}

#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct AxisConfig {
    pub covariate: String,
    /// explicit grid values, the observed values if absent
    #[serde( default )]
    pub values: Option<Vec<GridValue>>,
}

#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct GridConfig {
    pub name: String,
    pub vary: Vec<AxisConfig>,
}

#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct FitterSettings {
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
}

/// Settings of a complete analysis, read from TOML. Missing keys take the study defaults.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct AnalysisConfig {
    pub responses: Vec<Response>,
    /// fixed-effect terms of the full model, e.g. "BA", "BA:CI"
    pub terms: Vec<String>,
    pub grouping: String,
    pub partitions: Vec<Partition>,
    pub delta_threshold: f64,
    pub standardization: Standardization,
    /// numeric covariates to z-score
    pub standardize: Vec<Numeric>,
    /// baseline level per factor name
    pub baselines: BTreeMap<String, String>,
    pub grids: Vec<GridConfig>,
    pub confidence: f64,
    pub include_intercept: bool,
    /// drop collinear main effects from the full model before selection
    pub prune_collinear: bool,
    pub fitter: FitterSettings,
}

impl Default for FitterSettings {
    fn default() -> Self {
	let defaults = FitterConfig::default();
	FitterSettings{ max_outer_iterations: defaults.max_outer_iterations, max_inner_iterations: defaults.max_inner_iterations }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
	let axis = |covariate: &str| AxisConfig{ covariate: covariate.to_string(), values: None };
	AnalysisConfig{
	    responses: Response::ALL.to_vec(),
	    terms: ["BA", "CI", "BA:CI", "Temp", "Precip", "Jday"].iter().map( |t| t.to_string() ).collect(),
	    grouping: "Site".to_string(),
	    partitions: vec!(
		Partition::full(),
		Partition::years( "year1", [2017], true ),
		Partition::years( "year2", [2018], true ),
		Partition::years( "year3", [2019], true ),
	    ),
	    delta_threshold: 2.0,
	    standardization: Standardization::Global,
	    standardize: vec!( Numeric::Precipitation, Numeric::Temperature, Numeric::DayOfYear ),
	    baselines: BTreeMap::new(),
	    grids: vec!(
		GridConfig{ name: "BA:CI".to_string(), vary: vec!( axis( "BA" ), axis( "CI" )) },
		GridConfig{ name: "Temp".to_string(), vary: vec!( axis( "Temp" )) },
	    ),
	    confidence: 0.95,
	    include_intercept: false,
	    prune_collinear: false,
	    fitter: FitterSettings::default(),
	}
    }
}

impl AnalysisConfig {
    pub fn from_file<P: AsRef<Path>>( path: P ) -> Result<AnalysisConfig> {
	let text = fs::read_to_string( path.as_ref() )?;
	let config: AnalysisConfig = toml::from_str( &text )?;
	config.validate()?;
	debug!( "configuration read from {}", path.as_ref().display() );
	Ok( config )
    }

    /// Checks everything that can be checked without data
    pub fn validate( &self ) -> Result<()> {
	if self.responses.is_empty() {
	    return Err( AnalysisError::Config( "no responses configured".to_string() ));
	}
	if self.partitions.is_empty() {
	    return Err( AnalysisError::Config( "no partitions configured".to_string() ));
	}
	if !( self.delta_threshold >= 0.0 ) {
	    return Err( AnalysisError::Config( format!( "delta threshold {} is negative", self.delta_threshold )));
	}
	if !( self.confidence > 0.0 && self.confidence < 1.0 ) {
	    return Err( AnalysisError::Config( format!( "confidence level {} outside (0, 1)", self.confidence )));
	}
	let spec = self.full_spec( self.responses[ 0 ] )?;
	for term in spec.terms() {
	    for covariate in term.covariates() {
		if let Covariate::Numeric( n ) = covariate {
		    if !self.standardize.contains( &n ) {
			return Err( AnalysisError::Config( format!( "term {term} uses {} which is not standardized", n.name() )));
		    }
		}
	    }
	}
	self.prediction_grids()?;
	self.baseline_factors()?;
	Ok( () )
    }

    pub fn grouping_factor( &self ) -> Result<Factor> {
	match self.grouping.parse::<Covariate>()? {
	    Covariate::Factor( factor ) => Ok( factor ),
	    Covariate::Numeric( n ) => Err( AnalysisError::Config( format!( "grouping by numeric covariate {}", n.name() ))),
	}
    }

    /// The full model of a response, before selection
    pub fn full_spec( &self, response: Response ) -> Result<ModelSpec> {
	let terms = self.terms.iter().map( |t| t.parse::<Term>() ).collect::<Result<Vec<Term>>>()?;
	ModelSpec::new( response, terms, self.grouping_factor()? )
    }

    fn baseline_factors( &self ) -> Result<Vec<(Factor, &str)>> {
	self.baselines.iter().map( |(name, level)| match name.parse::<Covariate>()? {
	    Covariate::Factor( factor @ ( Factor::Habitat | Factor::ForestType | Factor::Site )) => Ok( (factor, level.as_str()) ),
	    other => Err( AnalysisError::Config( format!( "baseline of {other} cannot be configured" ))),
	}).collect()
    }

    pub fn preparer( &self ) -> Result<DataPreparer> {
	let mut preparer = DataPreparer::new( self.standardize.iter().copied() );
	for (factor, level) in self.baseline_factors()? {
	    preparer = preparer.with_baseline( factor, level );
	}
	Ok( preparer )
    }

    pub fn prediction_grids( &self ) -> Result<Vec<PredictionGrid>> {
	self.grids.iter().map( |grid| {
	    let vary = grid.vary.iter().map( |axis| {
		let values = match &axis.values {
		    Some( values ) => GridValues::Explicit( values.clone() ),
		    None => GridValues::Observed,
		};
		Ok( (axis.covariate.parse::<Covariate>()?, values) )
	    }).collect::<Result<Vec<_>>>()?;
	    if vary.is_empty() || vary.len() > 2 {
		return Err( AnalysisError::Config( format!( "prediction grid {} must vary one or two covariates", grid.name )));
	    }
	    Ok( PredictionGrid{ name: grid.name.clone(), vary })
	}).collect()
    }

    pub fn fitter_config( &self ) -> FitterConfig {
	FitterConfig{
	    max_outer_iterations: self.fitter.max_outer_iterations,
	    max_inner_iterations: self.fitter.max_inner_iterations,
	    ..FitterConfig::default()
	}
    }
}
