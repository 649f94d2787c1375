
use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use rustc_hash::FxHashMap;
use tracing::*;

use crate::data::{Covariate, CovariateSource, Factor, Numeric, PreparedDataset, ScaleParameters};
use crate::error::{AnalysisError, Result};

use super::{ModelSpec, Term};

/// Factor of a design column: a standardized numeric value or a level indicator
#[derive( Debug, Clone, PartialEq )]
pub enum Atom {
    Numeric( Numeric ),
    Indicator( Factor, String ),
}

/// A column of the fixed-effect design is the product of its atoms; no atoms is the intercept
#[derive( Debug, Clone, PartialEq )]
pub struct Column {
    pub name: String,
    /// index into the model's terms, None for the intercept
    pub term: Option<usize>,
    pub atoms: Vec<Atom>,
}

/// How model terms map onto design columns, and what is needed to rebuild a row later
#[derive( Debug, Clone )]
pub struct DesignLayout {
    pub terms: Vec<Term>,
    pub columns: Vec<Column>,
    /// names of columns dropped because they were linear combinations of earlier ones
    pub aliased: Vec<String>,
    /// mean standardized value of each numeric covariate in the fitted rows
    pub reference: BTreeMap<Numeric, f64>,
    pub levels: BTreeMap<Factor, Vec<String>>,
    pub scaling: BTreeMap<Numeric, ScaleParameters>,
}

/// relative residual norm below which a column counts as aliased
const ALIAS_TOLERANCE: f64 = 1e-7;

impl Atom {
    fn value<S: CovariateSource + ?Sized>( &self, source: &S ) -> f64 {
	match self {
	    Atom::Numeric( n ) => source.numeric( *n ),
	    Atom::Indicator( factor, level ) => if source.level( *factor ) == level.as_str() { 1.0 } else { 0.0 },
	}
    }

    fn name( &self ) -> String {
	match self {
	    Atom::Numeric( n ) => n.name().to_string(),
	    Atom::Indicator( factor, level ) => format!( "{}{}", factor.name(), level ),
	}
    }
}

impl Column {
    fn intercept() -> Column {
	Column{ name: "(Intercept)".to_string(), term: None, atoms: vec!() }
    }

    pub fn value<S: CovariateSource + ?Sized>( &self, source: &S ) -> f64 {
	self.atoms.iter().map( |a| a.value( source )).product()
    }
}

/// Treatment-coded atoms of one covariate; every level but the baseline gets an indicator
fn covariate_atoms( covariate: Covariate, data: &PreparedDataset ) -> Result<Vec<Atom>> {
    match covariate {
	Covariate::Numeric( n ) => {
	    if data.scaling( n ).is_none() {
		return Err( AnalysisError::Config( format!( "covariate {} was not standardized", n.name() )));
	    }
	    Ok( vec!( Atom::Numeric( n )))
	},
	Covariate::Factor( factor ) => {
	    let levels = data.levels( factor );
	    Ok( levels.iter().skip( 1 ).map( |l| Atom::Indicator( factor, l.clone() )).collect() )
	},
    }
}

fn term_columns( term_index: usize, term: &Term, data: &PreparedDataset ) -> Result<Vec<Column>> {
    let columns = match term {
	Term::Main( c ) => covariate_atoms( *c, data )?.into_iter()
	    .map( |a| Column{ name: a.name(), term: Some( term_index ), atoms: vec!( a ) })
	    .collect(),
	Term::Interaction( left, right ) => {
	    let (left, right) = (covariate_atoms( *left, data )?, covariate_atoms( *right, data )?);
	    let mut columns = Vec::with_capacity( left.len() * right.len() );
	    for l in &left {
		for r in &right {
		    columns.push( Column{
			name: format!( "{}:{}", l.name(), r.name() ),
			term: Some( term_index ),
			atoms: vec!( l.clone(), r.clone() ),
		    });
		}
	    }
	    columns
	},
    };
    Ok( columns )
}

impl DesignLayout {
    /// Expands the model's terms into a design matrix over the rows of data.
    /// Columns that are linear combinations of earlier columns are dropped.
    pub fn build( spec: &ModelSpec, data: &PreparedDataset ) -> Result<(DesignLayout, DMatrix<f64>)> {
	let mut candidates = vec!( Column::intercept() );
	for (index, term) in spec.terms().iter().enumerate() {
	    candidates.extend( term_columns( index, term, data )? );
	}

	let rows = data.rows();
	let n = rows.len();
	// modified Gram-Schmidt over the candidate columns, in order
	let mut basis: Vec<DVector<f64>> = Vec::new();
	let mut kept: Vec<(Column, DVector<f64>)> = Vec::new();
	let mut aliased = Vec::new();
	for column in candidates {
	    let values = DVector::from_iterator( n, rows.iter().map( |r| column.value( r )));
	    let norm = values.norm();
	    let mut residual = values.clone();
	    for q in &basis {
		let projection = q.dot( &residual );
		residual.axpy( -projection, q, 1.0 );
	    }
	    let residual_norm = residual.norm();
	    if norm > 0.0 && residual_norm > ALIAS_TOLERANCE * norm {
		basis.push( residual / residual_norm );
		kept.push( (column, values) );
	    } else {
		warn!( "{}: column {} is aliased and dropped", spec.label(), column.name );
		aliased.push( column.name );
	    }
	}

	let p = kept.len();
	let mut matrix = DMatrix::<f64>::zeros( n, p );
	for (j, (_, values)) in kept.iter().enumerate() {
	    matrix.set_column( j, values );
	}

	let mut reference = BTreeMap::new();
	for covariate in Numeric::ALL {
	    if let Some( scaling ) = data.scaling( covariate ) {
		let mean = if n > 0 { rows.iter().map( |r| r.numeric( covariate )).sum::<f64>() / n as f64 } else { 0.0 };
		reference.insert( covariate, mean );
		trace!( "{}: reference {mean:.3} (scale {:.3})", covariate.name(), scaling.sd );
	    }
	}
	let levels = Factor::ALL.iter().map( |f| (*f, data.levels( *f ).to_vec()) ).collect();
	let scaling = Numeric::ALL.iter().filter_map( |c| data.scaling( *c ).map( |s| (*c, s) )).collect();

	let layout = DesignLayout{
	    terms: spec.terms().to_vec(),
	    columns: kept.into_iter().map( |(c, _)| c ).collect(),
	    aliased,
	    reference,
	    levels,
	    scaling,
	};
	Ok( (layout, matrix) )
    }

    /// Design row for any covariate source
    pub fn row<S: CovariateSource + ?Sized>( &self, source: &S ) -> DVector<f64> {
	DVector::from_iterator( self.columns.len(), self.columns.iter().map( |c| c.value( source )))
    }

    /// Positions of the columns belonging to a term
    pub fn columns_of( &self, term_index: usize ) -> Vec<usize> {
	self.columns.iter().enumerate()
	    .filter( |(_, c)| c.term == Some( term_index ))
	    .map( |(i, _)| i )
	    .collect()
    }

    pub fn levels( &self, factor: Factor ) -> &[String] {
	self.levels.get( &factor ).map( |l| l.as_slice() ).unwrap_or( &[] )
    }
}

/// Index of each row's grouping level among the observed levels
pub fn group_indices( factor: Factor, data: &PreparedDataset ) -> (Vec<usize>, Vec<String>) {
    let mut index: FxHashMap<&str, usize> = FxHashMap::default();
    let mut names: Vec<String> = Vec::new();
    // follow the dataset's level order, skipping levels without rows
    let observed: rustc_hash::FxHashSet<&str> = data.rows().iter().map( |r| r.level( factor )).collect();
    for level in data.levels( factor ) {
	if observed.contains( level.as_str() ) {
	    index.insert( level.as_str(), names.len() );
	    names.push( level.clone() );
	}
    }
    let groups = data.rows().iter()
	.map( |r| *index.get( r.level( factor )).expect( "observed levels are indexed" ))
	.collect();
    (groups, names)
}
