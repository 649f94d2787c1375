
use bit_set::BitSet;
use bit_vec::BitVec;
use rayon::prelude::*;
use serde::Serialize;
use tracing::*;

use crate::*;
use crate::data::PreparedDataset;
use crate::error::{AnalysisError, Result};
use crate::model::{Fitter, ModelSpec, Scored, Term, satisfies_hierarchy};

/// Largest term set whose power set is enumerated
pub const MAX_TERMS: usize = 16;

/// A scored sub-model
#[derive( Debug, Clone, Serialize )]
pub struct Candidate {
    #[serde( skip )]
    pub spec: ModelSpec,
    pub terms: String,
    pub aicc: f64,
    /// AICc minus the best AICc of the set
    pub delta: f64,
    pub log_likelihood: f64,
    pub n_parameters: usize,
    pub converged: bool,
}

/// A sub-model whose fit failed
#[derive( Debug, Clone, Serialize )]
pub struct ExcludedCandidate {
    pub terms: String,
    pub reason: String,
}

/// Sub-models ranked by AICc, best first
#[derive( Debug, Clone, Serialize )]
pub struct CandidateSet {
    pub threshold: f64,
    pub candidates: Vec<Candidate>,
    pub excluded: Vec<ExcludedCandidate>,
}

/// All-subsets selection over a full model
pub struct ModelSelector<F> {
    fitter: F,
    threshold: f64,
}

/// Every subset of the full spec's terms that respects the hierarchy, in mask order.
/// The empty subset is the intercept-only model.
pub fn enumerate_submodels( full: &ModelSpec ) -> Result<Vec<ModelSpec>> {
    let terms = full.terms();
    if terms.len() > MAX_TERMS {
	return Err( AnalysisError::Config( format!( "{} terms exceed the limit of {MAX_TERMS} for all-subsets selection", terms.len() )));
    }
    let mut submodels = Vec::new();
    for bits in 0u32 .. ( 1 << terms.len() ) {
	let mask = BitSet::from_bit_vec( BitVec::from_fn( terms.len(), |i| bits & ( 1 << i ) != 0 ));
	let subset: Vec<Term> = mask.iter().map( |i| terms[ i ] ).collect();
	if satisfies_hierarchy( &subset ) {
	    submodels.push( full.with_terms( subset ));
	}
    }
    Ok( submodels )
}

impl<F> ModelSelector<F> where
    F: Fitter + Sync,
    F::Fit: Send,
{
    pub fn new( fitter: F, threshold: f64 ) -> ModelSelector<F> {
	ModelSelector{ fitter, threshold }
    }

    pub fn fitter( &self ) -> &F {
	&self.fitter
    }

    /// Fits every sub-model of full in parallel and ranks the successful fits.
    /// Fails only if no sub-model could be fitted.
    pub fn select( &self, full: &ModelSpec, data: &PreparedDataset ) -> Result<CandidateSet> {
	let _span = info_span!( "selection", response = %full.response ).entered();
	let submodels = enumerate_submodels( full )?;
	info!( "fitting {} candidate models", submodels.len() );

	let outcomes: Vec<(ModelSpec, Result<F::Fit>)> = submodels.into_par_iter()
	    .map( |spec| {
		let fit = self.fitter.fit( &spec, data );
		(spec, fit)
	    })
	    .collect();

	let mut candidates = Vec::new();
	let mut excluded = Vec::new();
	for (spec, outcome) in outcomes {
	    match outcome {
		Ok( fit ) => candidates.push( Candidate{
		    terms: spec.term_label(),
		    aicc: fit.aicc(),
		    delta: 0.0,
		    log_likelihood: fit.log_likelihood(),
		    n_parameters: fit.n_parameters(),
		    converged: fit.is_converged(),
		    spec,
		}),
		Err( err ) => {
		    warn!( "candidate {} excluded: {err}", spec.term_label() );
		    excluded.push( ExcludedCandidate{ terms: spec.term_label(), reason: err.to_string() });
		},
	    }
	}
	if candidates.is_empty() {
	    return Err( AnalysisError::NoCandidate{ excluded: excluded.len() });
	}

	candidates.sort_by( |a, b| a.aicc.total_cmp( &b.aicc )
			    .then( a.n_parameters.cmp( &b.n_parameters ))
			    .then_with( || a.terms.cmp( &b.terms )));
	let best = candidates[ 0 ].aicc;
	for candidate in candidates.iter_mut() {
	    candidate.delta = candidate.aicc - best;
	}

	let set = CandidateSet{ threshold: self.threshold, candidates, excluded };
	set.log( "selected", Level::INFO );
	Ok( set )
    }
}

impl CandidateSet {
    pub fn best( &self ) -> &Candidate {
	// a set is never built without candidates
	&self.candidates[ 0 ]
    }

    /// Candidates within the delta threshold of the best
    pub fn supported( &self ) -> impl Iterator<Item = &Candidate> + '_ {
	self.candidates.iter().take_while( move |c| c.delta <= self.threshold )
    }
}

impl Loggable for CandidateSet {
    fn log( &self, message: &str, level: Level ) {
	let supported: Vec<String> = self.supported()
	    .map( |c| format!( "[{}] AICc={:.2} d={:.2}", c.terms, c.aicc, c.delta ))
	    .collect();
	log_at( level, &format!( "{message}: {} candidates, {} excluded, supported {}",
				 self.candidates.len(), self.excluded.len(), supported.join( ", " )));
    }
}
