
use nalgebra::DMatrix;
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use statrs::statistics::Statistics;
use tracing::*;

use crate::*;
use crate::model::FittedModel;

/// Thresholds of the model checks
#[derive( Debug, Clone )]
pub struct DiagnosticsChecker {
    /// random intercept sd at or below which a fit counts as singular
    pub singular_sd: f64,
    /// Pearson dispersion ratios outside this band are flagged
    pub dispersion_bounds: (f64, f64),
    /// flag terms whose GVIF^(1/df) exceeds this
    pub gvif_threshold: f64,
}

#[derive( Debug, Clone, Serialize )]
pub struct DispersionCheck {
    /// sum of squared Pearson residuals
    pub statistic: f64,
    pub df: usize,
    pub ratio: f64,
    /// upper tail probability of the statistic under chi-squared(df)
    pub p_value: f64,
    pub flagged: bool,
}

/// Generalized variance inflation of one model term
#[derive( Debug, Clone, Serialize )]
pub struct GvifScore {
    pub term: String,
    pub gvif: f64,
    pub df: usize,
    /// GVIF^(1/(2 df)), comparable across terms with different df
    pub adjusted: f64,
    pub flagged: bool,
}

/// Sorted deviance residuals against standard normal quantiles
#[derive( Debug, Clone, Serialize )]
pub struct NormalityCheck {
    pub quantiles: Vec<f64>,
    pub residuals: Vec<f64>,
    /// probability plot correlation, 1 for perfectly normal residuals
    pub correlation: f64,
}

#[derive( Debug, Clone, Serialize )]
pub struct DiagnosticsReport {
    pub model: String,
    pub singular: bool,
    pub random_sd: f64,
    pub dispersion: DispersionCheck,
    /// empty for models with fewer than two terms
    pub collinearity: Vec<GvifScore>,
    pub normality: NormalityCheck,
}

impl Default for DiagnosticsChecker {
    fn default() -> Self {
	DiagnosticsChecker{ singular_sd: 0.05, dispersion_bounds: (0.1, 5.0), gvif_threshold: 3.0 }
    }
}

/// Pearson overdispersion check against residual degrees of freedom
pub fn dispersion_check( pearson_residuals: &[f64], df: usize, bounds: (f64, f64) ) -> DispersionCheck {
    let df = df.max( 1 );
    let statistic: f64 = pearson_residuals.iter().map( |r| r * r ).sum();
    let ratio = statistic / df as f64;
    let p_value = ChiSquared::new( df as f64 )
	.map( |chi| 1.0 - chi.cdf( statistic ))
	.unwrap_or( f64::NAN );
    DispersionCheck{ statistic, df, ratio, p_value, flagged: ratio < bounds.0 || ratio > bounds.1 }
}

/// GVIF per block of coefficients (Fox & Monette 1992) from their covariance.
/// Blocks index into `covariance`, which must not contain the intercept.
pub fn gvif_scores( covariance: &DMatrix<f64>, blocks: &[(String, Vec<usize>)], threshold: f64 ) -> Vec<GvifScore> {
    if blocks.len() < 2 {
	return vec!();
    }
    let p = covariance.nrows();
    let sd: Vec<f64> = ( 0 .. p ).map( |i| covariance[ (i, i) ].sqrt() ).collect();
    if sd.iter().any( |s| !s.is_finite() || *s <= 0.0 ) {
	warn!( "coefficient covariance has non-positive variances, no GVIF computed" );
	return vec!();
    }
    let correlation = DMatrix::from_fn( p, p, |i, j| covariance[ (i, j) ] / ( sd[ i ] * sd[ j ] ));
    let total = correlation.determinant();
    if total <= 0.0 || !total.is_finite() {
	warn!( "coefficient correlation matrix is singular, no GVIF computed" );
	return vec!();
    }

    blocks.iter().map( |(term, block)| {
	let rest: Vec<usize> = ( 0 .. p ).filter( |i| !block.contains( i )).collect();
	let inside = correlation.select_rows( block.iter() ).select_columns( block.iter() ).determinant();
	let outside = if rest.is_empty() { 1.0 } else { correlation.select_rows( rest.iter() ).select_columns( rest.iter() ).determinant() };
	let gvif = inside * outside / total;
	let df = block.len();
	let adjusted = gvif.powf( 1.0 / ( 2.0 * df as f64 ));
	GvifScore{ term: term.clone(), gvif, df, adjusted, flagged: adjusted * adjusted > threshold }
    }).collect()
}

/// Sorted residuals against Blom plotting positions
pub fn normality_check( residuals: &[f64] ) -> NormalityCheck {
    let mut sorted: Vec<f64> = residuals.iter().copied().filter( |r| r.is_finite() ).collect();
    sorted.sort_by( |a, b| a.total_cmp( b ));
    let n = sorted.len() as f64;
    let standard = Normal::new( 0.0, 1.0 ).expect( "standard normal parameters are valid" );
    let quantiles: Vec<f64> = ( 0 .. sorted.len() )
	.map( |i| standard.inverse_cdf(( i as f64 + 1.0 - 0.375 ) / ( n + 0.25 )))
	.collect();
    let correlation = pearson_correlation( &quantiles, &sorted );
    NormalityCheck{ quantiles, residuals: sorted, correlation }
}

fn pearson_correlation( x: &[f64], y: &[f64] ) -> f64 {
    if x.len() < 2 {
	return f64::NAN;
    }
    x.iter().covariance( y.iter() ) / ( x.iter().std_dev() * y.iter().std_dev() )
}

impl DiagnosticsChecker {
    /// Checks a fitted model. Never fails and never changes the model.
    pub fn diagnose( &self, model: &FittedModel ) -> DiagnosticsReport {
	let label = model.spec.label();
	let singular = model.random_sd <= self.singular_sd;
	if singular {
	    warn!( "{label}: singular fit, random intercept sd {:.4}", model.random_sd );
	}

	let dispersion = dispersion_check( &model.pearson_residuals(), model.df_residual(), self.dispersion_bounds );
	if dispersion.flagged {
	    warn!( "{label}: dispersion ratio {:.3} outside [{}, {}]", dispersion.ratio, self.dispersion_bounds.0, self.dispersion_bounds.1 );
	}

	// the intercept is always the first design column
	let p = model.coefficients.len();
	let blocks: Vec<(String, Vec<usize>)> = model.layout.terms.iter().enumerate()
	    .map( |(index, term)| (term.to_string(), model.layout.columns_of( index ).iter().map( |c| c - 1 ).collect::<Vec<usize>>()) )
	    .filter( |(_, columns)| !columns.is_empty() )
	    .collect();
	let collinearity = if p > 1 {
	    let covariance = model.covariance.view( (1, 1), (p - 1, p - 1) ).clone_owned();
	    gvif_scores( &covariance, &blocks, self.gvif_threshold )
	} else {
	    vec!()
	};
	for score in collinearity.iter().filter( |s| s.flagged ) {
	    warn!( "{label}: term {} has GVIF^(1/(2df)) {:.3}", score.term, score.adjusted );
	}

	let normality = normality_check( &model.deviance_residuals() );
	trace!( "{label}: probability plot correlation {:.4}", normality.correlation );

	DiagnosticsReport{ model: label, singular, random_sd: model.random_sd, dispersion, collinearity, normality }
    }
}

impl DiagnosticsReport {
    pub fn has_warnings( &self ) -> bool {
	self.singular || self.dispersion.flagged || self.collinearity.iter().any( |s| s.flagged )
    }
}

impl Loggable for DiagnosticsReport {
    fn log( &self, message: &str, level: Level ) {
	let gvif: Vec<String> = self.collinearity.iter().map( |s| format!( "{}={:.2}", s.term, s.adjusted )).collect();
	log_at( level, &format!( "{message}: {} | singular={} dispersion={:.3} (p={:.3}) gvif[{}] ppcc={:.3}",
				 self.model, self.singular, self.dispersion.ratio, self.dispersion.p_value,
				 gvif.join( " " ), self.normality.correlation ));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Scored;
    use crate::simulate::{Simulation, simulate};

    macro_rules! assert_approx {
	($real:expr, $expected:expr, $delta:expr) => {
	    if $real < $expected - $delta || $real > $expected + $delta {
		panic!( "Violate {:.4} == {:.4} (+-{:.4})", $real, $expected, $delta );
	    }
	}
    }

    #[test]
    /// Underdispersion is flagged but still reported
    fn test_dispersion_flag() {
	let residuals = vec!( 0.5; 20 );
	let check = dispersion_check( &residuals, 100, (0.1, 5.0) );
	assert_approx!( check.ratio, 0.05, 1e-12 );
	assert!( check.flagged );
	assert_approx!( check.p_value, 1.0, 1e-6 );

	let check = dispersion_check( &[1.0, -1.0, 1.2, -0.8], 4, (0.1, 5.0) );
	assert!( !check.flagged );
	assert!( check.p_value > 0.0 && check.p_value < 1.0 );
    }

    #[test]
    fn test_gvif_orthogonal() {
	let covariance = DMatrix::from_diagonal_element( 3, 3, 0.04 );
	let blocks = vec!( ("A".to_string(), vec!( 0 )), ("B".to_string(), vec!( 1, 2 )) );
	let scores = gvif_scores( &covariance, &blocks, 3.0 );
	assert_eq!( scores.len(), 2 );
	for score in scores {
	    assert_approx!( score.gvif, 1.0, 1e-9 );
	    assert!( !score.flagged );
	}
	assert_eq!( gvif_scores( &covariance, &blocks[ .. 1 ], 3.0 ).len(), 0 );
    }

    #[test]
    fn test_gvif_collinear() {
	// correlation 0.9 between the two coefficients
	let covariance = DMatrix::from_row_slice( 2, 2, &[4.0, 1.8, 1.8, 1.0] );
	let blocks = vec!( ("A".to_string(), vec!( 0 )), ("B".to_string(), vec!( 1 )) );
	let scores = gvif_scores( &covariance, &blocks, 3.0 );
	assert_approx!( scores[ 0 ].gvif, 1.0 / ( 1.0 - 0.81 ), 1e-9 );
	assert!( scores.iter().all( |s| s.flagged ));
	assert_approx!( scores[ 1 ].adjusted, ( 1.0f64 / 0.19 ).sqrt(), 1e-9 );
    }

    #[test]
    fn test_normality() {
	let standard = Normal::new( 0.0, 1.0 ).unwrap();
	let residuals: Vec<f64> = ( 1 ..= 50 ).rev().map( |i| standard.inverse_cdf(( i as f64 - 0.375 ) / 50.25 )).collect();
	let check = normality_check( &residuals );
	assert_approx!( check.correlation, 1.0, 1e-9 );
	assert!( check.residuals.windows( 2 ).all( |w| w[ 0 ] <= w[ 1 ] ));

	let skewed: Vec<f64> = ( 0 .. 50 ).map( |i| ( i as f64 / 5.0 ).exp() ).collect();
	assert!( normality_check( &skewed ).correlation < 0.9 );
    }

    fn fit( observations: Vec<crate::data::Observation>, terms: &[&str] ) -> FittedModel {
	use crate::data::*;
	use crate::model::*;

	let rows: Vec<(usize, Observation)> = observations.into_iter().enumerate().collect();
	let data = DataPreparer::new( [Numeric::Temperature] ).prepare( &rows ).unwrap();
	let terms = terms.iter().map( |t| t.parse().unwrap() ).collect();
	let spec = ModelSpec::new( Response::AllBats, terms, Factor::Site ).unwrap();
	NegBinFitter::default().fit( &spec, &data ).unwrap()
    }

    fn survey( seed: u64 ) -> Vec<crate::data::Observation> {
	simulate( &Simulation{ sites: 10, nights_per_year: 8, seed, ..Simulation::default() })
    }

    #[test]
    fn test_report_of_fitted_model() {
	let model = fit( survey( 3 ), &["BA", "CI", "BA:CI", "Temp"] );
	let report = DiagnosticsChecker::default().diagnose( &model );

	assert_eq!( report.collinearity.len(), 4 );
	assert_eq!( report.normality.residuals.len(), model.n_obs() );
	assert!( report.dispersion.ratio > 0.1 && report.dispersion.ratio < 5.0 );
	assert!( report.collinearity.iter().all( |s| s.gvif >= 1.0 - 1e-9 ));
	assert_eq!( report.dispersion.df, model.n_obs() - model.n_parameters() );
    }

    #[test]
    /// Sites with the same counts give a singular fit
    fn test_singular_report() {
	let pattern = [0, 2, 5, 1, 3, 8, 0, 4, 2, 6];
	let mut observations = Vec::new();
	for site in 0 .. 6 {
	    let mut nights = simulate( &Simulation{ sites: 1, nights_per_year: 5, years_before: vec!( 2016 ), years_after: vec!( 2017 ), seed: 1, ..Simulation::default() });
	    for (night, o) in nights.iter_mut().enumerate() {
		o.site = format!( "S{site}" );
		o.counts.all_bats = pattern[ night ];
	    }
	    observations.extend( nights );
	}
	let model = fit( observations, &[] );
	let report = DiagnosticsChecker::default().diagnose( &model );
	assert!( report.singular, "sd {}", report.random_sd );
	assert!( report.random_sd <= 0.05 );
	assert!( report.has_warnings() );
	assert!( report.collinearity.is_empty() );
    }

    #[test]
    /// A dispersion ratio of 0.05 is flagged and the report is still complete
    fn test_underdispersed_report() {
	let mut model = fit( survey( 8 ), &["BA"] );
	let df = model.df_residual() as f64;
	let shift = ( 0.05 * df / model.n_obs() as f64 ).sqrt();
	model.response = model.fitted.iter().map( |mu| mu + shift * model.variance( *mu ).sqrt() ).collect();

	let report = DiagnosticsChecker::default().diagnose( &model );
	assert_approx!( report.dispersion.ratio, 0.05, 1e-9 );
	assert!( report.dispersion.flagged );
	assert!( report.has_warnings() );
	assert_eq!( report.normality.residuals.len(), model.n_obs() );
	// a single term has nothing to be collinear with
	assert!( report.collinearity.is_empty() );
    }
}
