
use chrono::{NaiveDate, NaiveTime};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, Gamma, Normal, Poisson};
use tracing::*;

use crate::data::{Counts, Observation, RAW_AFTER, RAW_BEFORE, RAW_CONTROL, RAW_IMPACT};

/// Synthetic before-after control-impact survey with known effects.
/// Effects are on the log scale; the temperature effect is per standard deviation.
#[derive( Debug, Clone, Serialize, Deserialize )]
#[serde( default )]
pub struct Simulation {
    pub sites: usize,
    pub nights_per_year: usize,
    pub years_before: Vec<i32>,
    pub years_after: Vec<i32>,
    pub intercept: f64,
    pub before_after: f64,
    pub control_impact: f64,
    pub interaction: f64,
    pub temperature: f64,
    pub random_sd: f64,
    pub theta: f64,
    /// share of bat passes that are low frequency calls
    pub low_frequency_share: f64,
    pub seed: u64,
}

const MEAN_TEMPERATURE: f64 = 15.0;
const SD_TEMPERATURE: f64 = 4.0;

impl Default for Simulation {
    fn default() -> Self {
	Simulation{
	    sites: 12,
	    nights_per_year: 8,
	    years_before: vec!( 2016 ),
	    years_after: vec!( 2017, 2018, 2019 ),
	    intercept: 1.5,
	    before_after: 0.3,
	    control_impact: -0.2,
	    interaction: -0.6,
	    temperature: 0.4,
	    random_sd: 0.5,
	    theta: 3.0,
	    low_frequency_share: 0.6,
	    seed: 42,
	}
    }
}

/// Poisson draw, zero for a vanishing mean
fn sample_poisson<R: Rng>( lambda: f64, rng: &mut R ) -> u64 {
    match Poisson::new( lambda ) {
	Ok( poisson ) => poisson.sample( rng ) as u64,
	Err( _ ) => 0,
    }
}

/// Number of successes among count trials
fn sample_binomial<R: Rng>( share: f64, count: u64, rng: &mut R ) -> u64 {
    match Binomial::new( share.clamp( 0.0, 1.0 ), count ) {
	Ok( binomial ) => binomial.sample( rng ) as u64,
	Err( _ ) => 0,
    }
}

/// Negative binomial draw as a gamma mixture of Poissons
fn sample_negative_binomial<R: Rng>( mu: f64, theta: f64, rng: &mut R ) -> u64 {
    match Gamma::new( theta, theta / mu ) {
	Ok( gamma ) => sample_poisson( gamma.sample( rng ), rng ),
	Err( _ ) => sample_poisson( mu, rng ),
    }
}

/// Approximate civil times, later sunsets around midsummer
fn twilight( day_of_year: u32 ) -> (Option<NaiveTime>, Option<NaiveTime>) {
    let offset = ( day_of_year as i64 - 172 ).abs().min( 120 ) as u32;
    let sunset = 21 * 60 - offset / 2;
    let sunrise = 5 * 60 + 30 + offset / 2;
    (NaiveTime::from_hms_opt( sunset / 60, sunset % 60, 0 ), NaiveTime::from_hms_opt( sunrise / 60, sunrise % 60, 0 ))
}

/// Draws every site-night of the survey. The same simulation and seed give the same data.
pub fn simulate( simulation: &Simulation ) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64( simulation.seed );
    let standard = Normal::new( 0.0, 1.0 ).expect( "standard normal parameters are valid" );
    let nights = simulation.nights_per_year.clamp( 1, 180 );
    let spacing = ( 180 / nights ).max( 1 );

    let mut observations = Vec::with_capacity( simulation.sites * nights * ( simulation.years_before.len() + simulation.years_after.len() ));
    for site in 0 .. simulation.sites {
	let impact = site % 2 == 0;
	let site_effect = simulation.random_sd * standard.sample( &mut rng );
	let habitat = if rng.gen_bool( 0.5 ) { "riparian" } else { "upland" };
	let forest_type = if site % 3 == 0 { "ponderosa" } else { "mixed conifer" };

	let years = simulation.years_before.iter().map( |y| (*y, false) )
	    .chain( simulation.years_after.iter().map( |y| (*y, true) ));
	for (year, after) in years {
	    for night in 0 .. nights {
		let day_of_year = ( 140 + night * spacing + site % spacing ) as u32;
		let date = NaiveDate::from_yo_opt( year, day_of_year ).expect( "survey nights fall inside the year" );
		let (sunset, sunrise) = twilight( day_of_year );
		let temperature = MEAN_TEMPERATURE + SD_TEMPERATURE * standard.sample( &mut rng );
		let precipitation = if rng.gen_bool( 0.7 ) { 0.0 } else { ( 5.0 * rng.gen::<f64>() * 10.0 ).round() / 10.0 };

		let mut eta = simulation.intercept + site_effect
		    + simulation.temperature * ( temperature - MEAN_TEMPERATURE ) / SD_TEMPERATURE;
		if after {
		    eta += simulation.before_after;
		}
		if impact {
		    eta += simulation.control_impact;
		}
		if after && impact {
		    eta += simulation.interaction;
		}
		let all_bats = sample_negative_binomial( eta.exp(), simulation.theta, &mut rng );
		let low_frequency = sample_binomial( simulation.low_frequency_share, all_bats, &mut rng ).min( all_bats );

		observations.push( Observation{
		    site: format!( "S{:02}", site + 1 ),
		    date,
		    sunset,
		    sunrise,
		    counts: Counts{ all_bats, low_frequency, high_frequency: all_bats - low_frequency },
		    precipitation,
		    temperature: ( temperature * 10.0 ).round() / 10.0,
		    day_of_year: day_of_year as f64,
		    habitat: habitat.to_string(),
		    forest_type: forest_type.to_string(),
		    burn_status: if impact { RAW_IMPACT } else { RAW_CONTROL }.to_string(),
		    fire_period: if after { RAW_AFTER } else { RAW_BEFORE }.to_string(),
		});
	    }
	}
    }
    debug!( "simulated {} site nights at {} sites", observations.len(), simulation.sites );
    observations
}

#[cfg(test)]
mod test {
    use super::*;
    use statrs::statistics::Statistics;

    #[test]
    fn test_reproducible() {
	let simulation = Simulation{ sites: 4, nights_per_year: 3, ..Simulation::default() };
	let first = simulate( &simulation );
	let second = simulate( &simulation );
	assert_eq!( first.len(), 4 * 3 * 4 );
	let counts = |o: &Vec<Observation>| o.iter().map( |o| o.counts.all_bats ).collect::<Vec<u64>>();
	assert_eq!( counts( &first ), counts( &second ));
	assert!( first.iter().all( |o| o.counts.low_frequency + o.counts.high_frequency == o.counts.all_bats ));
    }

    #[test]
    /// Site nights are distinct dates
    fn test_layout() {
	let observations = simulate( &Simulation{ sites: 3, nights_per_year: 20, ..Simulation::default() });
	let mut keys: Vec<(String, NaiveDate)> = observations.iter().map( |o| (o.site.clone(), o.date) ).collect();
	keys.sort();
	keys.dedup();
	assert_eq!( keys.len(), observations.len() );
	assert_eq!( observations.iter().filter( |o| o.fire_period == RAW_BEFORE ).count(), 3 * 20 );
	// impact and control sites alternate
	let burn = |site: &str| observations.iter().find( |o| o.site == site ).map( |o| o.burn_status.clone() );
	assert_eq!( burn( "S01" ).as_deref(), Some( RAW_IMPACT ));
	assert_eq!( burn( "S02" ).as_deref(), Some( RAW_CONTROL ));
    }

    #[test]
    fn test_negative_binomial_moments() {
	let mut rng = StdRng::seed_from_u64( 5 );
	let draws: Vec<f64> = ( 0 .. 20000 ).map( |_| sample_negative_binomial( 6.0, 2.0, &mut rng ) as f64 ).collect();
	let mean = draws.iter().mean();
	let variance = draws.iter().variance();
	assert!(( mean - 6.0 ).abs() < 0.15, "mean {mean}" );
	// mu + mu^2 / theta = 24
	assert!(( variance - 24.0 ).abs() < 2.0, "variance {variance}" );
	let large = sample_poisson( 1000.0, &mut rng ) as f64;
	assert!(( large - 1000.0 ).abs() < 150.0 );
	assert_eq!( sample_poisson( 0.0, &mut rng ), 0 );
    }

    #[test]
    fn test_binomial_split() {
	let mut rng = StdRng::seed_from_u64( 9 );
	let draws: Vec<f64> = ( 0 .. 5000 ).map( |_| sample_binomial( 0.6, 10, &mut rng ) as f64 ).collect();
	assert!( draws.iter().all( |d| *d <= 10.0 ));
	assert!(( draws.clone().mean() - 6.0 ).abs() < 0.1 );
	assert_eq!( sample_binomial( 0.6, 0, &mut rng ), 0 );
	assert_eq!( sample_binomial( 1.0, 7, &mut rng ), 7 );
    }
}
