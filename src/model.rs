
use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::Level;

use crate::*;
use crate::data::{Covariate, Factor, PreparedDataset, Response};
use crate::error::{AnalysisError, Result};

mod design;
mod negbin;
mod optimize;

pub use design::{Atom, Column, DesignLayout, group_indices};
pub use negbin::{NegBinFitter, FitterConfig};
pub use optimize::{SimplexSearch, Minimum};

/// Family and link of every model fitted here
pub const FAMILY: &str = "negative binomial (log link)";

/// A fixed-effect term of a model formula
#[derive( Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash )]
pub enum Term {
    Main( Covariate ),
    /// pairwise interaction, requires both main effects
    Interaction( Covariate, Covariate ),
}

/// Response, fixed-effect terms and random intercept grouping of one model
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct ModelSpec {
    pub response: Response,
    terms: Vec<Term>,
    pub grouping: Factor,
}

#[derive( Debug, Clone, PartialEq, Serialize )]
pub enum FitStatus {
    Converged,
    /// estimates are the best available but provisional
    ConvergenceWarning { reason: String },
}

/// Anything a model fitting routine hands to model selection
pub trait Scored {
    fn log_likelihood( &self ) -> f64;

    /// number of estimated parameters, variance components included
    fn n_parameters( &self ) -> usize;

    fn n_obs( &self ) -> usize;

    fn is_converged( &self ) -> bool;

    fn aic( &self ) -> f64 {
	-2.0 * self.log_likelihood() + 2.0 * self.n_parameters() as f64
    }

    /// AIC corrected for small samples, infinite if there are too few observations
    fn aicc( &self ) -> f64 {
	let k = self.n_parameters() as f64;
	let n = self.n_obs() as f64;
	if n - k - 1.0 <= 0.0 {
	    return f64::INFINITY;
	}
	self.aic() + 2.0 * k * ( k + 1.0 ) / ( n - k - 1.0 )
    }
}

/// Fits a model specification to a dataset
pub trait Fitter {
    type Fit: Scored;

    fn fit( &self, spec: &ModelSpec, data: &PreparedDataset ) -> Result<Self::Fit>;
}

/// Result of a negative binomial mixed model fit. Read-only after creation.
#[derive( Debug, Clone )]
pub struct FittedModel {
    pub spec: ModelSpec,
    pub layout: DesignLayout,
    /// fixed effects in the order of `layout.columns`
    pub coefficients: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// standard deviation of the random intercept
    pub random_sd: f64,
    /// conditional modes of the random intercepts per observed group level
    pub random_effects: Vec<(String, f64)>,
    /// negative binomial size, Var = mu + mu^2 / theta
    pub theta: f64,
    /// Laplace approximation of the marginal log likelihood
    pub log_likelihood: f64,
    pub response: Vec<f64>,
    pub fitted: Vec<f64>,
    pub status: FitStatus,
    pub iterations: usize,
}

impl Term {
    pub fn covariates( &self ) -> Vec<Covariate> {
	match self {
	    Term::Main( c ) => vec!( *c ),
	    Term::Interaction( a, b ) => vec!( *a, *b ),
	}
    }

    pub fn involves( &self, covariate: Covariate ) -> bool {
	self.covariates().contains( &covariate )
    }

    pub fn is_interaction( &self ) -> bool {
	matches!( self, Term::Interaction( _, _ ))
    }

    /// Same term regardless of interaction order
    pub fn same_as( &self, other: &Term ) -> bool {
	match (self, other) {
	    (Term::Interaction( a, b ), Term::Interaction( c, d )) => ( a == c && b == d ) || ( a == d && b == c ),
	    _ => self == other,
	}
    }
}

impl fmt::Display for Term {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
	match self {
	    Term::Main( c ) => write!( f, "{c}" ),
	    Term::Interaction( a, b ) => write!( f, "{a}:{b}" ),
	}
    }
}

impl FromStr for Term {
    type Err = AnalysisError;

    fn from_str( s: &str ) -> Result<Self> {
	let parts: Vec<&str> = s.split( ':' ).collect();
	match parts.as_slice() {
	    [main] => Ok( Term::Main( main.parse()? )),
	    [left, right] => {
		let (left, right): (Covariate, Covariate) = (left.parse()?, right.parse()?);
		if left == right {
		    return Err( AnalysisError::Config( format!( "interaction '{s}' of a covariate with itself" )));
		}
		Ok( Term::Interaction( left, right ))
	    },
	    _ => Err( AnalysisError::Config( format!( "only pairwise interactions are supported, got '{s}'" ))),
	}
    }
}

/// True if every interaction comes with both of its main effects
pub fn satisfies_hierarchy( terms: &[Term] ) -> bool {
    terms.iter().all( |term| match term {
	Term::Main( _ ) => true,
	Term::Interaction( a, b ) => terms.contains( &Term::Main( *a )) && terms.contains( &Term::Main( *b )),
    })
}

impl ModelSpec {
    /// Validates the term set: no duplicates, hierarchy respected
    pub fn new( response: Response, terms: Vec<Term>, grouping: Factor ) -> Result<ModelSpec> {
	for (i, term) in terms.iter().enumerate() {
	    if terms[ .. i ].iter().any( |t| t.same_as( term )) {
		return Err( AnalysisError::Config( format!( "term {term} appears twice" )));
	    }
	}
	if !satisfies_hierarchy( &terms ) {
	    return Err( AnalysisError::Config( "interaction without both of its main effects".to_string() ));
	}
	Ok( ModelSpec{ response, terms, grouping })
    }

    pub fn terms( &self ) -> &[Term] {
	&self.terms
    }

    /// Same response and grouping with another term subset.
    /// Pre: terms satisfy the hierarchy
    pub fn with_terms( &self, terms: Vec<Term> ) -> ModelSpec {
	debug_assert!( satisfies_hierarchy( &terms ));
	ModelSpec{ response: self.response, terms, grouping: self.grouping }
    }

    /// Drops a covariate and every interaction depending on it
    pub fn without( &self, covariate: Covariate ) -> ModelSpec {
	let terms = self.terms.iter().copied().filter( |t| !t.involves( covariate )).collect();
	self.with_terms( terms )
    }

    /// Formula notation, e.g. `AllBats ~ BA + CI + BA:CI + (1|Site)`
    pub fn label( &self ) -> String {
	let fixed: Vec<String> = self.terms.iter().map( |t| t.to_string() ).collect();
	let fixed = if fixed.is_empty() { "1".to_string() } else { fixed.join( " + " ) };
	format!( "{} ~ {} + (1|{})", self.response, fixed, self.grouping.name() )
    }

    /// Terms only, e.g. `BA + CI`, `(null)` for the intercept-only model
    pub fn term_label( &self ) -> String {
	if self.terms.is_empty() {
	    return "(null)".to_string();
	}
	self.terms.iter().map( |t| t.to_string() ).collect::<Vec<String>>().join( " + " )
    }
}

impl fmt::Display for ModelSpec {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
	write!( f, "{}", self.label() )
    }
}

impl Scored for FittedModel {
    fn log_likelihood( &self ) -> f64 {
	self.log_likelihood
    }

    fn n_parameters( &self ) -> usize {
	// fixed effects, random intercept sd and negative binomial size
	self.coefficients.len() + 2
    }

    fn n_obs( &self ) -> usize {
	self.response.len()
    }

    fn is_converged( &self ) -> bool {
	self.status == FitStatus::Converged
    }
}

impl FittedModel {
    pub fn coefficient_names( &self ) -> Vec<&str> {
	self.layout.columns.iter().map( |c| c.name.as_str() ).collect()
    }

    pub fn std_errors( &self ) -> Vec<f64> {
	( 0 .. self.coefficients.len() ).map( |i| self.covariance[ (i, i) ].max( 0.0 ).sqrt() ).collect()
    }

    /// Observations minus estimated parameters, at least 1
    pub fn df_residual( &self ) -> usize {
	self.n_obs().saturating_sub( self.n_parameters() ).max( 1 )
    }

    /// Conditional variance of an observation with mean mu
    pub fn variance( &self, mu: f64 ) -> f64 {
	mu + mu * mu / self.theta
    }

    pub fn pearson_residuals( &self ) -> Vec<f64> {
	self.response.iter().zip( self.fitted.iter() )
	    .map( |(y, mu)| ( y - mu ) / self.variance( *mu ).sqrt() )
	    .collect()
    }

    pub fn deviance_residuals( &self ) -> Vec<f64> {
	let theta = self.theta;
	self.response.iter().zip( self.fitted.iter() )
	    .map( |(y, mu)| {
		let y_term = if *y > 0.0 { y * ( y / mu ).ln() } else { 0.0 };
		let deviance = 2.0 * ( y_term - ( y + theta ) * (( y + theta ) / ( mu + theta )).ln() );
		( y - mu ).signum() * deviance.max( 0.0 ).sqrt()
	    })
	    .collect()
    }

    pub fn is_provisional( &self ) -> bool {
	!self.is_converged()
    }
}

impl Loggable for FittedModel {
    fn log( &self, message: &str, level: Level ) {
	let names = self.coefficient_names();
	let estimates: Vec<String> = names.iter().zip( self.coefficients.iter() )
	    .map( |(name, b)| format!( "{name}={b:.3}" ))
	    .collect();
	log_at( level, &format!( "{message}: {} | {} | sd({})={:.3} theta={:.3} logLik={:.3} AICc={:.3} {:?}",
				 self.spec.label(), estimates.join( " " ), self.spec.grouping.name(),
				 self.random_sd, self.theta, self.log_likelihood, self.aicc(), self.status ));
    }
}
