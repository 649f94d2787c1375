
use std::cell::RefCell;

use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use tracing::*;

use crate::error::{AnalysisError, Result};

/// Derivative-free minimisation inside a box. The simplex runs on argmin's Nelder-Mead;
/// every evaluated point is projected onto the box first.
#[derive( Debug, Clone )]
pub struct SimplexSearch {
    lower: Vec<f64>,
    upper: Vec<f64>,
    max_iterations: u64,
    /// standard deviation of the objective over the simplex vertices at convergence
    tolerance: f64,
}

#[derive( Debug, Clone )]
pub struct Minimum {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Objective seen by argmin. Holds the caller's closure, which may carry state between calls.
struct Projected<'a, F> {
    search: &'a SimplexSearch,
    objective: RefCell<F>,
}

impl<F> CostFunction for Projected<'_, F> where
    F: FnMut( &[f64] ) -> f64,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost( &self, x: &Vec<f64> ) -> std::result::Result<f64, argmin::core::Error> {
	let x = self.search.project( x.clone() );
	let mut objective = self.objective.borrow_mut();
	let value = ( &mut *objective )( &x );
	Ok( if value.is_finite() { value } else { f64::INFINITY } )
    }
}

impl SimplexSearch {
    pub fn new( lower: Vec<f64>, upper: Vec<f64> ) -> SimplexSearch {
	assert_eq!( lower.len(), upper.len() );
	SimplexSearch{ lower, upper, max_iterations: 500, tolerance: 1e-9 }
    }

    pub fn with_max_iterations( mut self, max_iterations: usize ) -> SimplexSearch {
	self.max_iterations = max_iterations as u64;
	self
    }

    pub fn with_tolerance( mut self, tolerance: f64 ) -> SimplexSearch {
	self.tolerance = tolerance;
	self
    }

    pub fn project( &self, mut x: Vec<f64> ) -> Vec<f64> {
	for (i, xi) in x.iter_mut().enumerate() {
	    *xi = xi.clamp( self.lower[ i ], self.upper[ i ] );
	}
	x
    }

    /// Initial simplex: the projected start plus one vertex per coordinate, stepped inwards
    /// when the start sits on the upper bound.
    fn vertices( &self, start: &[f64], steps: &[f64] ) -> Vec<Vec<f64>> {
	let origin = self.project( start.to_vec() );
	let mut vertices = vec!( origin.clone() );
	for (i, step) in steps.iter().enumerate() {
	    let mut vertex = origin.clone();
	    vertex[ i ] += step;
	    let mut vertex = self.project( vertex );
	    if vertex[ i ] == origin[ i ] {
		vertex[ i ] -= step;
		vertex = self.project( vertex );
	    }
	    vertices.push( vertex );
	}
	vertices
    }

    /// Minimises objective from start. Steps give the initial simplex edge per coordinate.
    /// Non-finite objective values count as +infinity.
    pub fn minimize<F>( &self, start: &[f64], steps: &[f64], objective: F ) -> Result<Minimum> where
	F: FnMut( &[f64] ) -> f64,
    {
	assert_eq!( start.len(), steps.len() );
	let solver = NelderMead::new( self.vertices( start, steps ))
	    .with_sd_tolerance( self.tolerance )
	    .map_err( |err| AnalysisError::Numerical( format!( "simplex setup: {err}" )))?;
	let problem = Projected{ search: self, objective: RefCell::new( objective ) };
	let result = Executor::new( problem, solver )
	    .configure( |state| state.max_iters( self.max_iterations ))
	    .run()
	    .map_err( |err| AnalysisError::Numerical( format!( "simplex search: {err}" )))?;

	let state = result.state();
	let converged = matches!( state.get_termination_status(), TerminationStatus::Terminated( TerminationReason::SolverConverged ));
	let x = match state.get_best_param() {
	    Some( best ) => self.project( best.clone() ),
	    None => self.project( start.to_vec() ),
	};
	let minimum = Minimum{ x, value: state.get_best_cost(), iterations: state.get_iter() as usize, converged };
	debug!( "simplex stopped after {} iterations at {:.6} (converged: {converged})", minimum.iterations, minimum.value );
	Ok( minimum )
    }
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

    fn rosenbrock( x: &[f64] ) -> f64 {
	( 1.0 - x[ 0 ] ).powi( 2 ) + 100.0 * ( x[ 1 ] - x[ 0 ] * x[ 0 ] ).powi( 2 )
    }

    #[test]
    fn test_rosenbrock() {
	let search = SimplexSearch::new( vec!( -5.0, -5.0 ), vec!( 5.0, 5.0 ))
	    .with_max_iterations( 5000 )
	    .with_tolerance( 1e-14 );
	let minimum = search.minimize( &[-1.2, 1.0], &[0.5, 0.5], rosenbrock ).unwrap();
	assert!( minimum.converged );
	assert_approx!( minimum.x[ 0 ], 1.0, 1e-2 );
	assert_approx!( minimum.x[ 1 ], 1.0, 2e-2 );
    }

    #[test]
    /// The minimum outside the box ends up on the boundary
    fn test_bounded() {
	let search = SimplexSearch::new( vec!( 0.0, -10.0 ), vec!( 10.0, 10.0 ))
	    .with_max_iterations( 2000 )
	    .with_tolerance( 1e-12 );
	let minimum = search.minimize( &[1.0, 1.0], &[0.5, 0.5], |x| ( x[ 0 ] + 2.0 ).powi( 2 ) + ( x[ 1 ] - 3.0 ).powi( 2 )).unwrap();
	assert!( minimum.converged );
	assert!( minimum.x[ 0 ] >= 0.0 );
	assert_approx!( minimum.x[ 0 ], 0.0, 1e-3 );
	assert_approx!( minimum.x[ 1 ], 3.0, 1e-2 );
    }

    #[test]
    fn test_iteration_limit() {
	let search = SimplexSearch::new( vec!( -5.0, -5.0 ), vec!( 5.0, 5.0 )).with_max_iterations( 3 );
	let minimum = search.minimize( &[-1.2, 1.0], &[0.1, 0.1], rosenbrock ).unwrap();
	assert!( !minimum.converged );
	assert_eq!( minimum.iterations, 3 );
    }

    #[test]
    fn test_start_on_upper_bound() {
	let search = SimplexSearch::new( vec!( 0.0 ), vec!( 1.0 ));
	let vertices = search.vertices( &[1.0], &[0.25] );
	assert_eq!( vertices, vec!( vec!( 1.0 ), vec!( 0.75 )));
    }
}
