
use nalgebra::{DMatrix, DVector};
use statrs::function::gamma::ln_gamma;
use statrs::statistics::Statistics;
use tracing::*;

use crate::*;
use crate::data::PreparedDataset;
use crate::error::{AnalysisError, Result};

use super::*;

/// Settings of the negative binomial mixed model fit
#[derive( Debug, Clone )]
pub struct FitterConfig {
    /// simplex iterations over (random sd, log theta)
    pub max_outer_iterations: usize,
    /// scoring iterations for the joint mode of fixed and random effects
    pub max_inner_iterations: usize,
    /// relative change of the penalized log likelihood that ends the scoring
    pub inner_tolerance: f64,
    /// upper bound of the random intercept sd, the lower bound is 0
    pub max_random_sd: f64,
    pub theta_bounds: (f64, f64),
}

/// Negative binomial GLMM with log link and a random intercept, fitted by Laplace approximation.
///
/// For given random intercept sd and size theta, the fixed effects b and the spherical random
/// effects v (u = sd * v) are the joint mode of the penalized log likelihood, found by Fisher
/// scoring with step halving. The Laplace approximation of the marginal likelihood at that mode
/// is maximised over (sd, log theta) with a bounded simplex search.
#[derive( Debug, Clone, Default )]
pub struct NegBinFitter {
    config: FitterConfig,
}

/// Design, response and grouping of one fit
struct Problem<'a> {
    x: &'a DMatrix<f64>,
    y: &'a [f64],
    groups: &'a [usize],
    n_groups: usize,
    max_iterations: usize,
    tolerance: f64,
}

/// Joint mode for fixed variance parameters
#[derive( Debug, Clone )]
struct Mode {
    beta: DVector<f64>,
    spherical: DVector<f64>,
    mu: Vec<f64>,
    laplace: f64,
    information: DMatrix<f64>,
    converged: bool,
}

/// linear predictors are clamped to keep exp finite
const ETA_LIMIT: f64 = 30.0;
const STEP_HALVINGS: usize = 30;

impl Default for FitterConfig {
    fn default() -> Self {
	FitterConfig{
	    max_outer_iterations: 400,
	    max_inner_iterations: 100,
	    inner_tolerance: 1e-12,
	    max_random_sd: 10.0,
	    theta_bounds: (1e-3, 1e4),
	}
    }
}

/// Log probability of a count under a negative binomial with mean mu and size theta
pub fn nb_log_probability( y: f64, mu: f64, theta: f64 ) -> f64 {
    let count_term = if y > 0.0 { y * ( mu / ( theta + mu )).ln() } else { 0.0 };
    ln_gamma( y + theta ) - ln_gamma( theta ) - ln_gamma( y + 1.0 )
	+ theta * ( theta / ( theta + mu )).ln()
	+ count_term
}

impl<'a> Problem<'a> {
    fn means( &self, beta: &DVector<f64>, spherical: &DVector<f64>, sigma: f64 ) -> Vec<f64> {
	let eta = self.x * beta;
	eta.iter().zip( self.groups.iter() )
	    .map( |(e, g)| ( e + sigma * spherical[ *g ] ).clamp( -ETA_LIMIT, ETA_LIMIT ).exp() )
	    .collect()
    }

    /// Conditional log likelihood minus the spherical penalty
    fn penalized( &self, mu: &[f64], spherical: &DVector<f64>, theta: f64 ) -> f64 {
	let loglik: f64 = self.y.iter().zip( mu.iter() ).map( |(y, m)| nb_log_probability( *y, *m, theta )).sum();
	loglik - 0.5 * spherical.norm_squared()
    }

    /// Score and expected information of the penalized log likelihood in (b, v)
    fn score_information( &self, mu: &[f64], spherical: &DVector<f64>, sigma: f64, theta: f64 ) -> (DVector<f64>, DMatrix<f64>) {
	let (p, q) = (self.x.ncols(), self.n_groups);
	let m = p + q;
	let mut score = DVector::<f64>::zeros( m );
	let mut information = DMatrix::<f64>::zeros( m, m );
	for (i, (y, mu)) in self.y.iter().zip( mu.iter() ).enumerate() {
	    let weight = mu * theta / ( theta + mu );
	    let residual = ( y - mu ) * theta / ( theta + mu );
	    let g = p + self.groups[ i ];
	    for a in 0 .. p {
		let xa = self.x[ (i, a) ];
		score[ a ] += xa * residual;
		for b in 0 ..= a {
		    information[ (a, b) ] += weight * xa * self.x[ (i, b) ];
		}
		information[ (g, a) ] += sigma * weight * xa;
	    }
	    score[ g ] += sigma * residual;
	    information[ (g, g) ] += sigma * sigma * weight;
	}
	for j in 0 .. q {
	    score[ p + j ] -= spherical[ j ];
	    information[ (p + j, p + j) ] += 1.0;
	}
	// only the lower triangle was accumulated
	for a in 0 .. m {
	    for b in 0 .. a {
		information[ (b, a) ] = information[ (a, b) ];
	    }
	}
	(score, information)
    }

    fn initial( &self ) -> (DVector<f64>, DVector<f64>) {
	let mut beta = DVector::zeros( self.x.ncols() );
	let mean = self.y.iter().sum::<f64>() / self.y.len().max( 1 ) as f64;
	// the first column is always the intercept
	beta[ 0 ] = ( mean + 0.1 ).ln();
	(beta, DVector::zeros( self.n_groups ))
    }

    /// Fisher scoring for the joint mode, then the Laplace approximation at the mode
    /// Always starts from the same point, so the result depends on (sigma, theta) only.
    fn solve( &self, sigma: f64, theta: f64 ) -> Result<Mode> {
	let (p, q) = (self.x.ncols(), self.n_groups);
	let (mut beta, mut spherical) = self.initial();
	let mut mu = self.means( &beta, &spherical, sigma );
	let mut objective = self.penalized( &mu, &spherical, theta );
	if !objective.is_finite() {
	    return Err( AnalysisError::Numerical( "penalized likelihood is not finite at the start".to_string() ));
	}

	let mut converged = false;
	for iteration in 0 .. self.max_iterations {
	    let (score, information) = self.score_information( &mu, &spherical, sigma, theta );
	    let step = information.cholesky()
		.ok_or_else( || AnalysisError::Numerical( "information matrix is not positive definite".to_string() ))?
		.solve( &score );

	    let mut scale = 1.0;
	    let mut accepted = None;
	    for _ in 0 .. STEP_HALVINGS {
		let next_beta = &beta + step.rows( 0, p ) * scale;
		let next_spherical = &spherical + step.rows( p, q ) * scale;
		let next_mu = self.means( &next_beta, &next_spherical, sigma );
		let next_objective = self.penalized( &next_mu, &next_spherical, theta );
		if next_objective.is_finite() && next_objective >= objective - 1e-12 * objective.abs() {
		    accepted = Some( (next_beta, next_spherical, next_mu, next_objective) );
		    break;
		}
		scale *= 0.5;
	    }

	    let Some( (next_beta, next_spherical, next_mu, next_objective) ) = accepted else {
		// no ascent along the scoring direction, accept if the gradient vanished
		converged = score.amax() < 1e-6 * ( 1.0 + objective.abs() );
		trace!( "scoring stalled at iteration {iteration} (converged: {converged})" );
		break;
	    };
	    let change = ( next_objective - objective ).abs();
	    beta = next_beta;
	    spherical = next_spherical;
	    mu = next_mu;
	    objective = next_objective;
	    if change <= self.tolerance * ( objective.abs() + 1.0 ) {
		converged = true;
		break;
	    }
	}

	let (_, information) = self.score_information( &mu, &spherical, sigma, theta );
	let mut group_weights = vec!( 0.0; q );
	for (g, m) in self.groups.iter().zip( mu.iter() ) {
	    group_weights[ *g ] += m * theta / ( theta + m );
	}
	let log_determinant: f64 = group_weights.iter().map( |w| ( 1.0 + sigma * sigma * w ).ln() ).sum();
	let laplace = objective - 0.5 * log_determinant;

	Ok( Mode{ beta, spherical, mu, laplace, information, converged })
    }
}

/// Starting value of theta from the first two moments of the response
fn moment_theta( y: &[f64], bounds: (f64, f64) ) -> f64 {
    let mean = y.iter().mean();
    let variance = if y.len() > 1 { y.iter().variance() } else { 0.0 };
    let theta = if variance > mean * 1.001 { mean * mean / ( variance - mean ) } else { bounds.1 / 10.0 };
    theta.clamp( bounds.0, bounds.1 )
}

impl NegBinFitter {
    pub fn new( config: FitterConfig ) -> NegBinFitter {
	NegBinFitter{ config }
    }
}

impl Fitter for NegBinFitter {
    type Fit = FittedModel;

    fn fit( &self, spec: &ModelSpec, data: &PreparedDataset ) -> Result<FittedModel> {
	let _span = debug_span!( "fit", model = %spec.label() ).entered();

	let (groups, levels) = group_indices( spec.grouping, data );
	if levels.len() < 2 {
	    return Err( AnalysisError::InsufficientGroups{ factor: spec.grouping.name().to_string(), observed: levels.len() });
	}
	let (layout, x) = DesignLayout::build( spec, data )?;
	let y = data.response( spec.response );
	let problem = Problem{
	    x: &x,
	    y: &y,
	    groups: &groups,
	    n_groups: levels.len(),
	    max_iterations: self.config.max_inner_iterations,
	    tolerance: self.config.inner_tolerance,
	};

	let (theta_min, theta_max) = self.config.theta_bounds;
	let theta_start = moment_theta( &y, self.config.theta_bounds );
	let search = SimplexSearch::new( vec!( 0.0, theta_min.ln() ), vec!( self.config.max_random_sd, theta_max.ln() ))
	    .with_max_iterations( self.config.max_outer_iterations )
	    .with_tolerance( 1e-8 );
	let minimum = search.minimize( &[0.5, theta_start.ln()], &[0.25, 0.5], |parameters| {
	    let (sigma, theta) = (parameters[ 0 ], parameters[ 1 ].exp());
	    match problem.solve( sigma, theta ) {
		Ok( mode ) => -2.0 * mode.laplace,
		Err( err ) => {
		    trace!( "sd {sigma:.4} theta {theta:.4}: {err}" );
		    f64::INFINITY
		},
	    }
	})?;
	if !minimum.value.is_finite() {
	    return Err( AnalysisError::Numerical( format!( "{}: no finite likelihood for any variance parameters", spec.label() )));
	}

	let (sigma, theta) = (minimum.x[ 0 ], minimum.x[ 1 ].exp());
	let mode = problem.solve( sigma, theta )?;
	let p = x.ncols();
	let inverse = mode.information.clone().cholesky()
	    .ok_or_else( || AnalysisError::Numerical( "information matrix is not positive definite at the optimum".to_string() ))?
	    .inverse();
	let covariance = inverse.view( (0, 0), (p, p) ).clone_owned();

	let status = if !minimum.converged {
	    FitStatus::ConvergenceWarning{ reason: format!( "variance parameters not converged after {} simplex iterations", minimum.iterations ) }
	} else if !mode.converged {
	    FitStatus::ConvergenceWarning{ reason: "penalized scoring did not converge at the optimum".to_string() }
	} else {
	    FitStatus::Converged
	};

	let random_effects = levels.into_iter()
	    .zip( mode.spherical.iter() )
	    .map( |(level, v)| (level, sigma * v) )
	    .collect();
	let model = FittedModel{
	    spec: spec.clone(),
	    layout,
	    coefficients: mode.beta,
	    covariance,
	    random_sd: sigma,
	    random_effects,
	    theta,
	    log_likelihood: mode.laplace,
	    response: y.clone(),
	    fitted: mode.mu,
	    status,
	    iterations: minimum.iterations,
	};

	if let FitStatus::ConvergenceWarning{ reason } = &model.status {
	    warn!( "{}: {reason}; estimates are provisional", spec.label() );
	}
	model.log( "fitted", Level::DEBUG );
	Ok( model )
    }
}
