
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

mod prepare;

pub use prepare::{DataPreparer, PreparedDataset, PreparedRow, ScaleParameters, SiteSummary, describe_sites};

/// Raw category strings of the input table
pub const RAW_BEFORE: &str = "Pre";
pub const RAW_AFTER: &str = "Post";
pub const RAW_CONTROL: &str = "Unburn";
pub const RAW_IMPACT: &str = "Burn";

/// One site-night of acoustic monitoring. Immutable once loaded.
#[derive( Debug, Clone, PartialEq )]
pub struct Observation {
    pub site: String,
    pub date: NaiveDate,
    pub sunset: Option<NaiveTime>,
    pub sunrise: Option<NaiveTime>,
    pub counts: Counts,
    pub precipitation: f64,
    pub temperature: f64,
    pub day_of_year: f64,
    pub habitat: String,
    pub forest_type: String,
    /// raw burn status, mapped onto Control/Impact during preparation
    pub burn_status: String,
    /// raw pre/post fire status, mapped onto Before/After during preparation
    pub fire_period: String,
}

/// Echolocation passes per frequency group
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub struct Counts {
    pub all_bats: u64,
    pub low_frequency: u64,
    pub high_frequency: u64,
}

#[derive( Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize )]
pub enum Response {
    #[serde( rename = "AllBats" )]
    AllBats,
    #[serde( rename = "LowF" )]
    LowFrequency,
    #[serde( rename = "HighF" )]
    HighFrequency,
}

/// Numeric covariates that enter models as z-scores
#[derive( Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize )]
pub enum Numeric {
    #[serde( rename = "Precip" )]
    Precipitation,
    #[serde( rename = "Temp" )]
    Temperature,
    #[serde( rename = "Jday" )]
    DayOfYear,
    #[serde( rename = "Visits" )]
    Visits,
}

/// Categorical covariates with a fixed level set and a baseline
#[derive( Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize )]
pub enum Factor {
    #[serde( rename = "BA" )]
    BeforeAfter,
    #[serde( rename = "CI" )]
    ControlImpact,
    #[serde( rename = "Habitat" )]
    Habitat,
    #[serde( rename = "Forest" )]
    ForestType,
    #[serde( rename = "Site" )]
    Site,
}

#[derive( Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash )]
pub enum Covariate {
    Numeric( Numeric ),
    Factor( Factor ),
}

#[derive( Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize )]
pub enum BeforeAfter {
    #[serde( rename = "before" )]
    Before,
    #[serde( rename = "after" )]
    After,
}

#[derive( Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize )]
pub enum ControlImpact {
    #[serde( rename = "control" )]
    Control,
    #[serde( rename = "impact" )]
    Impact,
}

/// Rows of the prepared data that enter one pipeline run
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct Partition {
    pub name: String,
    /// calendar years to keep, every year if absent
    #[serde( default )]
    pub years: Option<Vec<i32>>,
    /// keep all pre-fire rows regardless of their year
    #[serde( default )]
    pub keep_before: bool,
}

/// Access to covariate values for one row of a design
pub trait CovariateSource {
    /// standardized value of a numeric covariate
    fn numeric( &self, covariate: Numeric ) -> f64;

    /// level of a factor
    fn level( &self, factor: Factor ) -> &str;
}

impl Counts {
    pub fn get( &self, response: Response ) -> u64 {
	match response {
	    Response::AllBats => self.all_bats,
	    Response::LowFrequency => self.low_frequency,
	    Response::HighFrequency => self.high_frequency,
	}
    }
}

impl Response {
    pub const ALL: [Response; 3] = [Response::AllBats, Response::LowFrequency, Response::HighFrequency];

    /// column name in the input table
    pub fn column( &self ) -> &'static str {
	match self {
	    Response::AllBats => "AllBats",
	    Response::LowFrequency => "LowF",
	    Response::HighFrequency => "HighF",
	}
    }
}

impl fmt::Display for Response {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
	write!( f, "{}", self.column() )
    }
}

impl FromStr for Response {
    type Err = AnalysisError;

    fn from_str( s: &str ) -> Result<Self> {
	Response::ALL.iter().copied()
	    .find( |r| r.column() == s )
	    .ok_or_else( || AnalysisError::Config( format!( "unknown response '{s}'" )))
    }
}

impl Numeric {
    pub const ALL: [Numeric; 4] = [Numeric::Precipitation, Numeric::Temperature, Numeric::DayOfYear, Numeric::Visits];

    pub fn index( &self ) -> usize {
	match self {
	    Numeric::Precipitation => 0,
	    Numeric::Temperature => 1,
	    Numeric::DayOfYear => 2,
	    Numeric::Visits => 3,
	}
    }

    pub fn name( &self ) -> &'static str {
	match self {
	    Numeric::Precipitation => "Precip",
	    Numeric::Temperature => "Temp",
	    Numeric::DayOfYear => "Jday",
	    Numeric::Visits => "Visits",
	}
    }
}

impl Factor {
    pub const ALL: [Factor; 5] = [Factor::BeforeAfter, Factor::ControlImpact, Factor::Habitat, Factor::ForestType, Factor::Site];

    pub fn name( &self ) -> &'static str {
	match self {
	    Factor::BeforeAfter => "BA",
	    Factor::ControlImpact => "CI",
	    Factor::Habitat => "Habitat",
	    Factor::ForestType => "Forest",
	    Factor::Site => "Site",
	}
    }
}

impl fmt::Display for Covariate {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
	match self {
	    Covariate::Numeric( n ) => write!( f, "{}", n.name() ),
	    Covariate::Factor( factor ) => write!( f, "{}", factor.name() ),
	}
    }
}

impl FromStr for Covariate {
    type Err = AnalysisError;

    fn from_str( s: &str ) -> Result<Self> {
	let s = s.trim();
	if let Some( n ) = Numeric::ALL.iter().find( |n| n.name() == s ) {
	    return Ok( Covariate::Numeric( *n ));
	}
	if let Some( factor ) = Factor::ALL.iter().find( |f| f.name() == s ) {
	    return Ok( Covariate::Factor( *factor ));
	}
	Err( AnalysisError::Config( format!( "unknown covariate '{s}'" )))
    }
}

impl BeforeAfter {
    /// Maps the raw pre/post string, rejecting anything else
    pub fn from_raw( value: &str, row: usize ) -> Result<BeforeAfter> {
	match value {
	    RAW_BEFORE => Ok( BeforeAfter::Before ),
	    RAW_AFTER => Ok( BeforeAfter::After ),
	    other => Err( AnalysisError::MalformedCategory { field: "Fire", value: other.to_string(), row }),
	}
    }

    pub fn level( &self ) -> &'static str {
	match self {
	    BeforeAfter::Before => "before",
	    BeforeAfter::After => "after",
	}
    }
}

impl ControlImpact {
    /// Maps the raw burn status string, rejecting anything else
    pub fn from_raw( value: &str, row: usize ) -> Result<ControlImpact> {
	match value {
	    RAW_CONTROL => Ok( ControlImpact::Control ),
	    RAW_IMPACT => Ok( ControlImpact::Impact ),
	    other => Err( AnalysisError::MalformedCategory { field: "Burn", value: other.to_string(), row }),
	}
    }

    pub fn level( &self ) -> &'static str {
	match self {
	    ControlImpact::Control => "control",
	    ControlImpact::Impact => "impact",
	}
    }
}

impl Observation {
    /// Raw (unstandardized) value of a numeric covariate; visits are not a raw field
    pub fn raw_numeric( &self, covariate: Numeric ) -> Option<f64> {
	match covariate {
	    Numeric::Precipitation => Some( self.precipitation ),
	    Numeric::Temperature => Some( self.temperature ),
	    Numeric::DayOfYear => Some( self.day_of_year ),
	    Numeric::Visits => None,
	}
    }

    pub fn year( &self ) -> i32 {
	self.date.year()
    }
}

impl Partition {
    /// The whole series
    pub fn full() -> Partition {
	Partition{ name: "full".to_string(), years: None, keep_before: false }
    }

    pub fn years<I: IntoIterator<Item = i32>>( name: &str, years: I, keep_before: bool ) -> Partition {
	Partition{ name: name.to_string(), years: Some( years.into_iter().collect() ), keep_before }
    }

    pub fn contains( &self, year: i32, period: BeforeAfter ) -> bool {
	if self.keep_before && period == BeforeAfter::Before {
	    return true;
	}
	match &self.years {
	    Some( years ) => years.contains( &year ),
	    None => true,
	}
    }

    /// Distinct years, for logging
    pub fn describe( &self ) -> String {
	match &self.years {
	    Some( years ) => {
		let years: BTreeSet<&i32> = years.iter().collect();
		format!( "{} {:?}{}", self.name, years, if self.keep_before { " + before" } else { "" } )
	    },
	    None => self.name.clone(),
	}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_category_mapping() {
	assert_eq!( BeforeAfter::from_raw( "Pre", 0 ).unwrap(), BeforeAfter::Before );
	assert_eq!( BeforeAfter::from_raw( "Post", 0 ).unwrap(), BeforeAfter::After );
	assert_eq!( ControlImpact::from_raw( "Unburn", 0 ).unwrap(), ControlImpact::Control );
	assert_eq!( ControlImpact::from_raw( "Burn", 0 ).unwrap(), ControlImpact::Impact );
	// matching is exact
	assert!( matches!( ControlImpact::from_raw( "burn", 3 ),
			   Err( AnalysisError::MalformedCategory { field: "Burn", row: 3, .. } )));
	assert!( BeforeAfter::from_raw( "pre ", 0 ).is_err() );
    }

    #[test]
    fn test_covariate_names() {
	for n in Numeric::ALL {
	    assert_eq!( n.name().parse::<Covariate>().unwrap(), Covariate::Numeric( n ));
	}
	for f in Factor::ALL {
	    assert_eq!( Covariate::Factor( f ).to_string().parse::<Covariate>().unwrap(), Covariate::Factor( f ));
	}
	assert!( "Rain".parse::<Covariate>().is_err() );
	assert_eq!( "LowF".parse::<Response>().unwrap(), Response::LowFrequency );
    }

    #[test]
    fn test_partition_membership() {
	let year = Partition::years( "year1", [2018], true );
	assert!( year.contains( 2016, BeforeAfter::Before ));
	assert!( year.contains( 2018, BeforeAfter::After ));
	assert!( !year.contains( 2019, BeforeAfter::After ));

	let strict = Partition::years( "2018 only", [2018], false );
	assert!( !strict.contains( 2016, BeforeAfter::Before ));
	assert!( Partition::full().contains( 1999, BeforeAfter::After ));
    }
}
