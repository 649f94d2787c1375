
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use statrs::statistics::Statistics;
use tracing::*;

use crate::error::{AnalysisError, Result};

use super::*;

/// Mean and sample standard deviation used to z-score a covariate
#[derive( Debug, Clone, Copy, PartialEq, Serialize )]
pub struct ScaleParameters {
    pub mean: f64,
    pub sd: f64,
}

/// Reshapes observations into an analysis-ready table
#[derive( Debug, Clone )]
pub struct DataPreparer {
    /// numeric covariates to standardize
    covariates: Vec<Numeric>,
    /// baseline levels for the data-driven factors
    baselines: BTreeMap<Factor, String>,
}

#[derive( Debug, Clone )]
pub struct PreparedRow {
    pub observation: Observation,
    /// position in the input table
    pub row: usize,
    pub before_after: BeforeAfter,
    pub control_impact: ControlImpact,
    /// number of distinct visit dates of this row's site
    pub visits: u32,
    /// z-scores indexed by `Numeric::index`, NaN where not standardized
    standardized: [f64; 4],
}

/// Observations with derived factors and standardized covariates.
/// Standardization and factor levels survive partitioning, so subsets stay comparable.
#[derive( Debug, Clone )]
pub struct PreparedDataset {
    rows: Vec<PreparedRow>,
    scaling: BTreeMap<Numeric, ScaleParameters>,
    /// level sets with the baseline first
    levels: BTreeMap<Factor, Vec<String>>,
}

/// One line of the site description table
#[derive( Debug, Clone, PartialEq, Serialize )]
pub struct SiteSummary {
    pub site: String,
    pub treatment: ControlImpact,
    pub habitat: String,
    pub forest_type: String,
    pub visits: u32,
    pub nights_before: usize,
    pub nights_after: usize,
    pub mean_all_bats: f64,
}

impl DataPreparer {
    pub fn new<I: IntoIterator<Item = Numeric>>( covariates: I ) -> DataPreparer {
	let mut covariates: Vec<Numeric> = covariates.into_iter().collect();
	covariates.sort();
	covariates.dedup();
	DataPreparer{ covariates, baselines: BTreeMap::new() }
    }

    /// Fixes the baseline of a data-driven factor; Before/After and Control/Impact have fixed baselines
    pub fn with_baseline( mut self, factor: Factor, level: &str ) -> DataPreparer {
	self.baselines.insert( factor, level.to_string() );
	self
    }

    /// Derives factors, visit counts and z-scores for the given frame
    pub fn prepare( &self, observations: &[(usize, Observation)] ) -> Result<PreparedDataset> {
	let _span = debug_span!( "prepare", rows = observations.len() ).entered();

	let visits = count_visits( observations.iter().map( |(_, o)| o ));
	let mut rows: Vec<PreparedRow> = Vec::with_capacity( observations.len() );
	for (row, observation) in observations {
	    let before_after = BeforeAfter::from_raw( &observation.fire_period, *row )?;
	    let control_impact = ControlImpact::from_raw( &observation.burn_status, *row )?;
	    let visits = *visits.get( &observation.site ).expect( "every site was counted" );
	    rows.push( PreparedRow{
		observation: observation.clone(),
		row: *row,
		before_after,
		control_impact,
		visits,
		standardized: [f64::NAN; 4],
	    });
	}

	let mut scaling = BTreeMap::new();
	for covariate in &self.covariates {
	    let values: Vec<f64> = rows.iter().map( |r| r.raw_numeric( *covariate )).collect();
	    let parameters = scale_parameters( &values )
		.ok_or_else( || AnalysisError::DegenerateCovariance{ covariate: covariate.name().to_string() })?;
	    debug!( "{}: mean {:.3} sd {:.3}", covariate.name(), parameters.mean, parameters.sd );
	    for r in rows.iter_mut() {
		r.standardized[ covariate.index() ] = ( r.raw_numeric( *covariate ) - parameters.mean ) / parameters.sd;
	    }
	    scaling.insert( *covariate, parameters );
	}

	let mut levels = BTreeMap::new();
	levels.insert( Factor::BeforeAfter, vec!( "before".to_string(), "after".to_string() ));
	levels.insert( Factor::ControlImpact, vec!( "control".to_string(), "impact".to_string() ));
	for factor in [Factor::Habitat, Factor::ForestType, Factor::Site] {
	    let observed: BTreeSet<&str> = rows.iter().map( |r| r.level( factor )).collect();
	    let mut factor_levels: Vec<String> = observed.into_iter().map( String::from ).collect();
	    if let Some( baseline ) = self.baselines.get( &factor ) {
		let position = factor_levels.iter().position( |l| l == baseline )
		    .ok_or_else( || AnalysisError::Config( format!( "baseline '{baseline}' is not a level of {}", factor.name() )))?;
		let baseline = factor_levels.remove( position );
		factor_levels.insert( 0, baseline );
	    }
	    levels.insert( factor, factor_levels );
	}

	info!( "prepared {} rows from {} sites", rows.len(), levels[ &Factor::Site ].len() );
	Ok( PreparedDataset{ rows, scaling, levels })
    }
}

/// Distinct visit dates per site
fn count_visits<'a, I: Iterator<Item = &'a Observation>>( observations: I ) -> BTreeMap<String, u32> {
    let mut dates: BTreeMap<&str, BTreeSet<NaiveDate>> = BTreeMap::new();
    for o in observations {
	dates.entry( o.site.as_str() ).or_default().insert( o.date );
    }
    dates.into_iter().map( |(site, d)| (site.to_string(), d.len() as u32) ).collect()
}

/// Mean and sample sd, None if the values are constant or too few
fn scale_parameters( values: &[f64] ) -> Option<ScaleParameters> {
    if values.len() < 2 {
	return None;
    }
    let mean = values.iter().mean();
    let sd = values.iter().std_dev();
    if !( sd > 1e-12 * mean.abs().max( 1.0 )) {
	return None;
    }
    Some( ScaleParameters{ mean, sd })
}

impl PreparedRow {
    pub fn raw_numeric( &self, covariate: Numeric ) -> f64 {
	self.observation.raw_numeric( covariate ).unwrap_or( self.visits as f64 )
    }
}

impl CovariateSource for PreparedRow {
    fn numeric( &self, covariate: Numeric ) -> f64 {
	self.standardized[ covariate.index() ]
    }

    fn level( &self, factor: Factor ) -> &str {
	match factor {
	    Factor::BeforeAfter => self.before_after.level(),
	    Factor::ControlImpact => self.control_impact.level(),
	    Factor::Habitat => &self.observation.habitat,
	    Factor::ForestType => &self.observation.forest_type,
	    Factor::Site => &self.observation.site,
	}
    }
}

impl PreparedDataset {
    pub fn rows( &self ) -> &[PreparedRow] {
	&self.rows
    }

    pub fn len( &self ) -> usize {
	self.rows.len()
    }

    pub fn is_empty( &self ) -> bool {
	self.rows.is_empty()
    }

    pub fn scaling( &self, covariate: Numeric ) -> Option<ScaleParameters> {
	self.scaling.get( &covariate ).copied()
    }

    /// Levels of a factor, baseline first
    pub fn levels( &self, factor: Factor ) -> &[String] {
	self.levels.get( &factor ).map( |l| l.as_slice() ).unwrap_or( &[] )
    }

    /// Number of levels that actually occur in the rows
    pub fn observed_levels( &self, factor: Factor ) -> usize {
	self.rows.iter().map( |r| r.level( factor )).collect::<BTreeSet<&str>>().len()
    }

    pub fn response( &self, response: Response ) -> Vec<f64> {
	self.rows.iter().map( |r| r.observation.counts.get( response ) as f64 ).collect()
    }

    /// Keeps the rows of a partition. Scaling and levels are carried over unchanged.
    pub fn partition( &self, partition: &Partition ) -> PreparedDataset {
	let rows: Vec<PreparedRow> = self.rows.iter()
	    .filter( |r| partition.contains( r.observation.year(), r.before_after ))
	    .cloned()
	    .collect();
	debug!( "partition {} keeps {} of {} rows", partition.describe(), rows.len(), self.rows.len() );
	PreparedDataset{ rows, scaling: self.scaling.clone(), levels: self.levels.clone() }
    }
}

/// Per-site description: treatment, habitat, effort and mean activity
pub fn describe_sites( data: &PreparedDataset ) -> Vec<SiteSummary> {
    let mut by_site: BTreeMap<&str, Vec<&PreparedRow>> = BTreeMap::new();
    for r in data.rows() {
	by_site.entry( r.observation.site.as_str() ).or_default().push( r );
    }
    by_site.into_iter().map( |(site, rows)| {
	let first = rows[ 0 ];
	let nights_before = rows.iter().filter( |r| r.before_after == BeforeAfter::Before ).count();
	let total: u64 = rows.iter().map( |r| r.observation.counts.all_bats ).sum();
	SiteSummary{
	    site: site.to_string(),
	    treatment: first.control_impact,
	    habitat: first.observation.habitat.clone(),
	    forest_type: first.observation.forest_type.clone(),
	    visits: first.visits,
	    nights_before,
	    nights_after: rows.len() - nights_before,
	    mean_all_bats: total as f64 / rows.len() as f64,
	}
    }).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    macro_rules! assert_approx {
	($real:expr, $expected:expr, $delta:expr) => {
	    if $real < $expected - $delta || $real > $expected + $delta {
		panic!( "Violate {:.4} == {:.4} (+-{:.4})", $real, $expected, $delta );
	    }
	}
    }

    fn observation( site: &str, date: &str, temperature: f64, burn: &str, fire: &str ) -> Observation {
	Observation{
	    site: site.to_string(),
	    date: NaiveDate::parse_from_str( date, "%Y-%m-%d" ).unwrap(),
	    sunset: None,
	    sunrise: None,
	    counts: Counts{ all_bats: 3, low_frequency: 1, high_frequency: 2 },
	    precipitation: 0.0,
	    temperature,
	    day_of_year: 150.0,
	    habitat: "riparian".to_string(),
	    forest_type: "pine".to_string(),
	    burn_status: burn.to_string(),
	    fire_period: fire.to_string(),
	}
    }

    fn sample() -> Vec<(usize, Observation)> {
	vec!(
	    observation( "A", "2016-06-01", 12.0, "Burn", "Pre" ),
	    observation( "A", "2016-06-02", 15.0, "Burn", "Pre" ),
	    observation( "A", "2018-06-01", 18.0, "Burn", "Post" ),
	    observation( "B", "2016-06-01", 11.0, "Unburn", "Pre" ),
	    observation( "B", "2018-06-01", 21.0, "Unburn", "Post" ),
	    observation( "B", "2019-06-01", 9.0, "Unburn", "Post" ),
	    observation( "C", "2019-06-03", 14.5, "Unburn", "Post" ),
	).into_iter().enumerate().collect()
    }

    #[test]
    /// Standardized covariates have zero mean and unit sd over the prepared frame
    fn test_standardized_moments() {
	let data = DataPreparer::new( [Numeric::Temperature, Numeric::Visits] ).prepare( &sample() ).unwrap();
	for covariate in [Numeric::Temperature, Numeric::Visits] {
	    let z: Vec<f64> = data.rows().iter().map( |r| r.numeric( covariate )).collect();
	    let n = z.len() as f64;
	    let mean = z.iter().sum::<f64>() / n;
	    let sd = ( z.iter().map( |v| ( v - mean ).powi( 2 )).sum::<f64>() / ( n - 1.0 )).sqrt();
	    assert_approx!( mean, 0.0, 1e-9 );
	    assert_approx!( sd, 1.0, 1e-9 );
	}
	// not requested
	assert!( data.rows()[ 0 ].numeric( Numeric::Precipitation ).is_nan() );
    }

    #[test]
    fn test_derived_factors_and_visits() {
	let data = DataPreparer::new( Vec::<Numeric>::new() ).prepare( &sample() ).unwrap();
	let rows = data.rows();
	assert_eq!( rows[ 0 ].before_after, BeforeAfter::Before );
	assert_eq!( rows[ 2 ].before_after, BeforeAfter::After );
	assert_eq!( rows[ 0 ].control_impact, ControlImpact::Impact );
	assert_eq!( rows[ 3 ].control_impact, ControlImpact::Control );
	assert_eq!( rows[ 0 ].visits, 3 );
	assert_eq!( rows[ 3 ].visits, 3 );
	assert_eq!( rows[ 6 ].visits, 1 );
	assert_eq!( data.levels( Factor::BeforeAfter )[ 0 ], "before" );
	assert_eq!( data.levels( Factor::ControlImpact )[ 0 ], "control" );
	assert_eq!( data.levels( Factor::Site ), &["A", "B", "C"] );
    }

    #[test]
    /// An unknown burn status is an error, not a missing value
    fn test_malformed_category() {
	let mut rows = sample();
	rows[ 4 ].1.burn_status = "Burned".to_string();
	let result = DataPreparer::new( Vec::<Numeric>::new() ).prepare( &rows );
	match result {
	    Err( AnalysisError::MalformedCategory { field, value, row } ) => {
		assert_eq!( field, "Burn" );
		assert_eq!( value, "Burned" );
		assert_eq!( row, 4 );
	    },
	    other => panic!( "expected malformed category, got {other:?}" ),
	}
    }

    #[test]
    fn test_degenerate_covariate() {
	// precipitation is zero everywhere
	let result = DataPreparer::new( [Numeric::Precipitation] ).prepare( &sample() );
	assert!( matches!( result, Err( AnalysisError::DegenerateCovariance { .. } )));
    }

    #[test]
    /// Partitions reuse the scaling of the full frame
    fn test_partition_keeps_scaling() {
	let data = DataPreparer::new( [Numeric::Temperature] ).prepare( &sample() ).unwrap();
	let year = data.partition( &Partition::years( "2019", [2019], true ));
	assert_eq!( year.len(), 5 );
	assert_eq!( year.scaling( Numeric::Temperature ), data.scaling( Numeric::Temperature ));
	assert_eq!( year.levels( Factor::Site ), data.levels( Factor::Site ));
	assert_eq!( year.observed_levels( Factor::Site ), 3 );
	// z-scores are untouched by filtering
	let last = year.rows().last().unwrap();
	assert_eq!( last.numeric( Numeric::Temperature ), data.rows()[ 6 ].numeric( Numeric::Temperature ));
    }

    #[test]
    fn test_baseline_override() {
	let mut rows = sample();
	rows[ 0 ].1.habitat = "upland".to_string();
	let data = DataPreparer::new( Vec::<Numeric>::new() ).with_baseline( Factor::Habitat, "upland" ).prepare( &rows ).unwrap();
	assert_eq!( data.levels( Factor::Habitat ), &["upland", "riparian"] );
	let missing = DataPreparer::new( Vec::<Numeric>::new() ).with_baseline( Factor::Habitat, "meadow" ).prepare( &rows );
	assert!( matches!( missing, Err( AnalysisError::Config( _ ))));
    }

    #[test]
    fn test_site_description() {
	let data = DataPreparer::new( Vec::<Numeric>::new() ).prepare( &sample() ).unwrap();
	let sites = describe_sites( &data );
	assert_eq!( sites.len(), 3 );
	assert_eq!( sites[ 0 ].site, "A" );
	assert_eq!( sites[ 0 ].treatment, ControlImpact::Impact );
	assert_eq!( sites[ 0 ].nights_before, 2 );
	assert_eq!( sites[ 0 ].nights_after, 1 );
	assert_approx!( sites[ 1 ].mean_all_bats, 3.0, 1e-12 );
    }
}
