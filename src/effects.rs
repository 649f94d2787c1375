
use std::collections::BTreeMap;
use std::fmt;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::*;

use crate::*;
use crate::data::{Covariate, CovariateSource, Factor, Numeric, PreparedDataset, Response};
use crate::error::{AnalysisError, Result};
use crate::model::{DesignLayout, FittedModel};

/// One fixed effect with its Wald test
#[derive( Debug, Clone, Serialize )]
pub struct EffectRow {
    pub response: Response,
    pub partition: String,
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z: f64,
    pub p_value: f64,
}

#[derive( Debug, Clone, Default, Serialize )]
pub struct EffectTable {
    pub rows: Vec<EffectRow>,
}

/// A grid value, raw scale for numerics and a level name for factors
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( untagged )]
pub enum GridValue {
    Number( f64 ),
    Level( String ),
}

#[derive( Debug, Clone, PartialEq )]
pub enum GridValues {
    /// distinct values (or levels) present in the model data
    Observed,
    Explicit( Vec<GridValue> ),
}

/// Covariates varied by a marginal prediction; the first gives x, the second the group
#[derive( Debug, Clone )]
pub struct PredictionGrid {
    pub name: String,
    pub vary: Vec<(Covariate, GridValues)>,
}

#[derive( Debug, Clone, Serialize )]
pub struct PredictionRow {
    pub response: Response,
    pub partition: String,
    pub grid: String,
    pub x: String,
    pub group: Option<String>,
    pub predicted: f64,
    pub conf_low: f64,
    pub conf_high: f64,
}

#[derive( Debug, Clone, Default, Serialize )]
pub struct PredictionCurve {
    pub rows: Vec<PredictionRow>,
}

/// Coefficient tables and marginal predictions of fitted models
#[derive( Debug, Clone )]
pub struct EffectExtractor {
    /// confidence level of prediction intervals
    pub confidence: f64,
}

/// Covariate values of one grid point. Numerics not on the grid sit at their mean in the
/// model data, factors at their baseline level.
struct Setting<'a> {
    layout: &'a DesignLayout,
    numerics: BTreeMap<Numeric, f64>,
    levels: BTreeMap<Factor, String>,
}

impl fmt::Display for GridValue {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
	match self {
	    GridValue::Number( x ) => write!( f, "{x}" ),
	    GridValue::Level( l ) => write!( f, "{l}" ),
	}
    }
}

impl<'a> CovariateSource for Setting<'a> {
    fn numeric( &self, covariate: Numeric ) -> f64 {
	self.numerics.get( &covariate ).copied()
	    .or_else( || self.layout.reference.get( &covariate ).copied() )
	    .unwrap_or( 0.0 )
    }

    fn level( &self, factor: Factor ) -> &str {
	match self.levels.get( &factor ) {
	    Some( level ) => level.as_str(),
	    None => self.layout.levels( factor ).first().map( |l| l.as_str() ).unwrap_or( "" ),
	}
    }
}

impl Default for EffectExtractor {
    fn default() -> Self {
	EffectExtractor{ confidence: 0.95 }
    }
}

impl EffectTable {
    /// Tags every row with the partition it was estimated on
    pub fn labelled( mut self, partition: &str ) -> EffectTable {
	for row in self.rows.iter_mut() {
	    row.partition = partition.to_string();
	}
	self
    }
}

impl PredictionCurve {
    pub fn labelled( mut self, partition: &str ) -> PredictionCurve {
	for row in self.rows.iter_mut() {
	    row.partition = partition.to_string();
	}
	self
    }
}

/// Values of one grid axis, checked against the model's covariate
fn axis_values( covariate: Covariate, values: &GridValues, layout: &DesignLayout, data: &PreparedDataset ) -> Result<Vec<GridValue>> {
    match (covariate, values) {
	(Covariate::Numeric( n ), GridValues::Observed) => {
	    let mut observed: Vec<f64> = data.rows().iter().map( |r| r.raw_numeric( n )).collect();
	    observed.sort_by( |a, b| a.total_cmp( b ));
	    observed.dedup();
	    Ok( observed.into_iter().map( GridValue::Number ).collect() )
	},
	(Covariate::Factor( f ), GridValues::Observed) => {
	    let present: Vec<&str> = data.rows().iter().map( |r| r.level( f )).collect();
	    Ok( layout.levels( f ).iter()
		.filter( |l| present.contains( &l.as_str() ))
		.map( |l| GridValue::Level( l.clone() ))
		.collect() )
	},
	(Covariate::Numeric( n ), GridValues::Explicit( values )) => values.iter().map( |v| match v {
	    GridValue::Number( _ ) => Ok( v.clone() ),
	    GridValue::Level( l ) => Err( AnalysisError::Config( format!( "grid value '{l}' of numeric covariate {} is not a number", n.name() ))),
	}).collect(),
	(Covariate::Factor( f ), GridValues::Explicit( values )) => values.iter().map( |v| match v {
	    GridValue::Level( l ) if layout.levels( f ).contains( l ) => Ok( v.clone() ),
	    _ => Err( AnalysisError::Config( format!( "'{v}' is not a level of {}", f.name() ))),
	}).collect(),
    }
}

impl EffectExtractor {
    pub fn new( confidence: f64 ) -> EffectExtractor {
	EffectExtractor{ confidence }
    }

    /// Estimates, standard errors and Wald tests of the fixed effects
    pub fn coefficients( &self, model: &FittedModel, include_intercept: bool ) -> EffectTable {
	let standard = Normal::new( 0.0, 1.0 ).expect( "standard normal parameters are valid" );
	let errors = model.std_errors();
	let rows = model.coefficient_names().into_iter().enumerate()
	    .filter( |(i, _)| include_intercept || model.layout.columns[ *i ].term.is_some() )
	    .map( |(i, name)| {
		let estimate = model.coefficients[ i ];
		let z = if errors[ i ] > 0.0 && errors[ i ].is_finite() {
		    estimate / errors[ i ]
		} else {
		    warn!( "{}: {name} has standard error {}, no Wald test", model.spec.label(), errors[ i ] );
		    f64::NAN
		};
		EffectRow{
		    response: model.spec.response,
		    partition: String::new(),
		    term: name.to_string(),
		    estimate,
		    std_error: errors[ i ],
		    z,
		    p_value: if z.is_nan() { f64::NAN } else { 2.0 * ( 1.0 - standard.cdf( z.abs() )) },
		}
	    })
	    .collect();
	EffectTable{ rows }
    }

    /// Population-level predictions on the response scale over one or two covariates,
    /// random effects at zero, with intervals from the link scale
    pub fn predict( &self, model: &FittedModel, grid: &PredictionGrid, data: &PreparedDataset ) -> Result<PredictionCurve> {
	if grid.vary.is_empty() || grid.vary.len() > 2 {
	    return Err( AnalysisError::Config( format!( "prediction grid {} must vary one or two covariates", grid.name )));
	}
	if !( self.confidence > 0.0 && self.confidence < 1.0 ) {
	    return Err( AnalysisError::Config( format!( "confidence level {} outside (0, 1)", self.confidence )));
	}
	let layout = &model.layout;
	for (covariate, _) in &grid.vary {
	    if !layout.terms.iter().any( |t| t.involves( *covariate )) {
		debug!( "{}: {covariate} is not in the model, predictions are flat along it", model.spec.label() );
	    }
	}
	let axes: Vec<(Covariate, Vec<GridValue>)> = grid.vary.iter()
	    .map( |(c, values)| axis_values( *c, values, layout, data ).map( |v| (*c, v) ))
	    .collect::<Result<_>>()?;

	let standard = Normal::new( 0.0, 1.0 ).expect( "standard normal parameters are valid" );
	let critical = standard.inverse_cdf( 0.5 + self.confidence / 2.0 );
	let groups: Vec<Option<&GridValue>> = match axes.get( 1 ) {
	    Some( (_, values) ) => values.iter().map( Some ).collect(),
	    None => vec!( None ),
	};

	let mut rows = Vec::new();
	for group in &groups {
	    for x in &axes[ 0 ].1 {
		let mut setting = Setting{ layout, numerics: BTreeMap::new(), levels: BTreeMap::new() };
		setting.assign( axes[ 0 ].0, x );
		if let (Some( value ), Some( (covariate, _) )) = (group, axes.get( 1 )) {
		    setting.assign( *covariate, value );
		}
		let design: DVector<f64> = layout.row( &setting );
		let eta = design.dot( &model.coefficients );
		let se = ( design.transpose() * &model.covariance * &design )[ (0, 0) ].max( 0.0 ).sqrt();
		rows.push( PredictionRow{
		    response: model.spec.response,
		    partition: String::new(),
		    grid: grid.name.clone(),
		    x: x.to_string(),
		    group: group.map( |g| g.to_string() ),
		    predicted: eta.exp(),
		    conf_low: ( eta - critical * se ).exp(),
		    conf_high: ( eta + critical * se ).exp(),
		});
	    }
	}
	trace!( "{}: {} prediction rows for grid {}", model.spec.label(), rows.len(), grid.name );
	Ok( PredictionCurve{ rows })
    }
}

impl<'a> Setting<'a> {
    fn assign( &mut self, covariate: Covariate, value: &GridValue ) {
	match (covariate, value) {
	    (Covariate::Numeric( n ), GridValue::Number( raw )) => {
		let z = match self.layout.scaling.get( &n ) {
		    Some( scaling ) => ( raw - scaling.mean ) / scaling.sd,
		    None => *raw,
		};
		self.numerics.insert( n, z );
	    },
	    (Covariate::Factor( f ), GridValue::Level( level )) => {
		self.levels.insert( f, level.clone() );
	    },
	    // axis values are checked against their covariate
	    _ => {},
	}
    }
}

impl Loggable for EffectTable {
    fn log( &self, message: &str, level: Level ) {
	let rows: Vec<String> = self.rows.iter()
	    .map( |r| format!( "{}={:.3} (se {:.3}, p {:.4})", r.term, r.estimate, r.std_error, r.p_value ))
	    .collect();
	log_at( level, &format!( "{message}: {}", rows.join( ", " )));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::DMatrix;
    use crate::data::*;
    use crate::model::*;
    use crate::simulate::{Simulation, simulate};

    macro_rules! assert_approx {
	($real:expr, $expected:expr, $delta:expr) => {
	    if $real < $expected - $delta || $real > $expected + $delta {
		panic!( "Violate {:.4} == {:.4} (+-{:.4})", $real, $expected, $delta );
	    }
	}
    }

    fn dataset() -> PreparedDataset {
	let rows: Vec<(usize, Observation)> = simulate( &Simulation{ sites: 4, nights_per_year: 4, years_after: vec!( 2017 ), seed: 9, ..Simulation::default() })
	    .into_iter().enumerate().collect();
	DataPreparer::new( [Numeric::Temperature] ).prepare( &rows ).unwrap()
    }

    /// A model with fixed coefficients over the simulated design
    fn model( data: &PreparedDataset ) -> FittedModel {
	let terms = ["BA", "CI", "BA:CI", "Temp"].iter().map( |t| t.parse().unwrap() ).collect();
	let spec = ModelSpec::new( Response::AllBats, terms, Factor::Site ).unwrap();
	let (layout, _) = DesignLayout::build( &spec, data ).unwrap();
	let n = data.len();
	FittedModel{
	    spec,
	    layout,
	    coefficients: DVector::from_vec( vec!( 1.0, 0.5, -0.25, -0.75, 0.2 )),
	    covariance: DMatrix::from_diagonal_element( 5, 5, 0.01 ),
	    random_sd: 0.4,
	    random_effects: vec!(),
	    theta: 2.0,
	    log_likelihood: -100.0,
	    response: vec!( 1.0; n ),
	    fitted: vec!( 1.0; n ),
	    status: FitStatus::Converged,
	    iterations: 10,
	}
    }

    fn baci_grid() -> PredictionGrid {
	PredictionGrid{
	    name: "BA:CI".to_string(),
	    vary: vec!( (Covariate::Factor( Factor::BeforeAfter ), GridValues::Observed),
			(Covariate::Factor( Factor::ControlImpact ), GridValues::Observed) ),
	}
    }

    #[test]
    fn test_coefficients() {
	let data = dataset();
	let model = model( &data );
	let table = EffectExtractor::default().coefficients( &model, false );
	assert_eq!( table.rows.len(), 4 );
	assert_eq!( table.rows[ 0 ].term, "BAafter" );
	assert_approx!( table.rows[ 0 ].z, 5.0, 1e-12 );
	assert!( table.rows[ 0 ].p_value < 1e-5 );
	assert_eq!( EffectExtractor::default().coefficients( &model, true ).rows.len(), 5 );
	assert_eq!( table.labelled( "full" ).rows[ 3 ].partition, "full" );
    }

    #[test]
    /// A zero standard error leaves the row in the table without a test
    fn test_degenerate_standard_error() {
	let data = dataset();
	let mut model = model( &data );
	model.covariance[ (2, 2) ] = 0.0;
	let table = EffectExtractor::default().coefficients( &model, false );
	assert_eq!( table.rows.len(), 4 );
	let row = &table.rows[ 1 ];
	assert_eq!( row.term, "CIimpact" );
	assert_eq!( row.std_error, 0.0 );
	assert!( row.z.is_nan() && row.p_value.is_nan() );
	assert!( table.rows[ 0 ].p_value.is_finite() );
    }

    #[test]
    /// Cell means of the BACI design with temperature at its mean
    fn test_baci_predictions() {
	let data = dataset();
	let model = model( &data );
	let curve = EffectExtractor::default().predict( &model, &baci_grid(), &data ).unwrap();
	assert_eq!( curve.rows.len(), 4 );
	let temperature = 0.2 * model.layout.reference[ &Numeric::Temperature ];
	let cell = |x: &str, group: &str| curve.rows.iter().find( |r| r.x == x && r.group.as_deref() == Some( group )).unwrap().predicted;
	assert_approx!( cell( "before", "control" ), ( 1.0 + temperature ).exp(), 1e-9 );
	assert_approx!( cell( "after", "impact" ), ( 1.0 + 0.5 - 0.25 - 0.75 + temperature ).exp(), 1e-9 );
	for row in &curve.rows {
	    assert!( row.conf_low < row.predicted && row.predicted < row.conf_high );
	}
    }

    #[test]
    fn test_prediction_idempotent() {
	let data = dataset();
	let model = model( &data );
	let grid = PredictionGrid{
	    name: "Temp".to_string(),
	    vary: vec!( (Covariate::Numeric( Numeric::Temperature ), GridValues::Explicit( vec!( GridValue::Number( 10.0 ), GridValue::Number( 20.0 ))))),
	};
	let extractor = EffectExtractor::new( 0.9 );
	let first = extractor.predict( &model, &grid, &data ).unwrap();
	let second = extractor.predict( &model, &grid, &data ).unwrap();
	let values = |c: &PredictionCurve| c.rows.iter().map( |r| (r.predicted, r.conf_low, r.conf_high) ).collect::<Vec<_>>();
	assert_eq!( values( &first ), values( &second ));
	assert_eq!( first.rows.len(), 2 );
	assert!( first.rows[ 1 ].predicted > first.rows[ 0 ].predicted );
	let scaling = data.scaling( Numeric::Temperature ).unwrap();
	assert_approx!( first.rows[ 0 ].predicted, ( 1.0 + 0.2 * ( 10.0 - scaling.mean ) / scaling.sd ).exp(), 1e-9 );
    }

    #[test]
    fn test_invalid_grids() {
	let data = dataset();
	let model = model( &data );
	let extractor = EffectExtractor::default();
	let unknown_level = PredictionGrid{
	    name: "bad".to_string(),
	    vary: vec!( (Covariate::Factor( Factor::BeforeAfter ), GridValues::Explicit( vec!( GridValue::Level( "during".to_string() ))))),
	};
	assert!( extractor.predict( &model, &unknown_level, &data ).is_err() );
	let empty = PredictionGrid{ name: "none".to_string(), vary: vec!() };
	assert!( matches!( extractor.predict( &model, &empty, &data ), Err( AnalysisError::Config( _ ))));
    }
}
