
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::data::{Counts, Observation};
use crate::error::{AnalysisError, Result};

/// One line of the survey table as it is stored
#[derive( Debug, Clone, Serialize, Deserialize )]
struct RawRecord {
    #[serde( rename = "Site" )]
    site: String,
    #[serde( rename = "Date" )]
    date: String,
    #[serde( rename = "Sunset", default )]
    sunset: String,
    #[serde( rename = "Sunrise", default )]
    sunrise: String,
    #[serde( rename = "AllBats" )]
    all_bats: u64,
    #[serde( rename = "LowF" )]
    low_frequency: u64,
    #[serde( rename = "HighF" )]
    high_frequency: u64,
    #[serde( rename = "Precip" )]
    precipitation: f64,
    #[serde( rename = "Temp" )]
    temperature: f64,
    #[serde( rename = "Jday" )]
    day_of_year: f64,
    #[serde( rename = "Habitat" )]
    habitat: String,
    #[serde( rename = "ForestType" )]
    forest_type: String,
    #[serde( rename = "Burn" )]
    burn_status: String,
    #[serde( rename = "Fire" )]
    fire_period: String,
}

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];
const TIME_FORMATS: [&str; 2] = ["%H:%M", "%H:%M:%S"];

fn parse_date( value: &str, row: usize ) -> Result<NaiveDate> {
    DATE_FORMATS.iter()
	.find_map( |format| NaiveDate::parse_from_str( value, format ).ok() )
	.ok_or_else( || AnalysisError::Parse{ field: "Date", row, message: format!( "'{value}' is not a date" ) })
}

/// Empty cells are missing times
fn parse_time( field: &'static str, value: &str, row: usize ) -> Result<Option<NaiveTime>> {
    if value.is_empty() || value == "NA" {
	return Ok( None );
    }
    TIME_FORMATS.iter()
	.find_map( |format| NaiveTime::parse_from_str( value, format ).ok() )
	.map( Some )
	.ok_or_else( || AnalysisError::Parse{ field, row, message: format!( "'{value}' is not a time of day" ) })
}

impl RawRecord {
    fn into_observation( self, row: usize ) -> Result<Observation> {
	Ok( Observation{
	    date: parse_date( &self.date, row )?,
	    sunset: parse_time( "Sunset", &self.sunset, row )?,
	    sunrise: parse_time( "Sunrise", &self.sunrise, row )?,
	    site: self.site,
	    counts: Counts{ all_bats: self.all_bats, low_frequency: self.low_frequency, high_frequency: self.high_frequency },
	    precipitation: self.precipitation,
	    temperature: self.temperature,
	    day_of_year: self.day_of_year,
	    habitat: self.habitat,
	    forest_type: self.forest_type,
	    burn_status: self.burn_status,
	    fire_period: self.fire_period,
	})
    }

    fn from_observation( observation: &Observation ) -> RawRecord {
	let time = |t: &Option<NaiveTime>| t.map( |t| t.format( "%H:%M" ).to_string() ).unwrap_or_default();
	RawRecord{
	    site: observation.site.clone(),
	    date: observation.date.format( "%Y-%m-%d" ).to_string(),
	    sunset: time( &observation.sunset ),
	    sunrise: time( &observation.sunrise ),
	    all_bats: observation.counts.all_bats,
	    low_frequency: observation.counts.low_frequency,
	    high_frequency: observation.counts.high_frequency,
	    precipitation: observation.precipitation,
	    temperature: observation.temperature,
	    day_of_year: observation.day_of_year,
	    habitat: observation.habitat.clone(),
	    forest_type: observation.forest_type.clone(),
	    burn_status: observation.burn_status.clone(),
	    fire_period: observation.fire_period.clone(),
	}
    }
}

/// Reads the survey table. Rows are numbered by their line in the file, the header is line 1.
pub fn read_observations<R: std::io::Read>( reader: R ) -> Result<Vec<(usize, Observation)>> {
    let mut reader = csv::ReaderBuilder::new()
	.trim( csv::Trim::All )
	.from_reader( reader );
    let mut observations = Vec::new();
    for (index, record) in reader.deserialize::<RawRecord>().enumerate() {
	let row = index + 2;
	observations.push( (row, record?.into_observation( row )? ));
    }
    Ok( observations )
}

pub fn read_observations_from<P: AsRef<Path>>( path: P ) -> Result<Vec<(usize, Observation)>> {
    let file = File::open( path.as_ref() )?;
    let observations = read_observations( file )?;
    info!( "read {} observations from {}", observations.len(), path.as_ref().display() );
    Ok( observations )
}

/// Writes observations in the layout `read_observations` expects
pub fn write_observations<P: AsRef<Path>>( path: P, observations: &[Observation] ) -> Result<()> {
    let mut writer = csv::Writer::from_path( path )?;
    for observation in observations {
	writer.serialize( RawRecord::from_observation( observation ))?;
    }
    writer.flush()?;
    Ok( () )
}

/// Writes serializable rows as a CSV table with a header
pub fn write_csv<T: Serialize, P: AsRef<Path>>( path: P, rows: &[T] ) -> Result<()> {
    let mut writer = csv::Writer::from_path( path.as_ref() )?;
    for row in rows {
	writer.serialize( row )?;
    }
    writer.flush()?;
    debug!( "wrote {} rows to {}", rows.len(), path.as_ref().display() );
    Ok( () )
}

/// Writes a serializable report to a file
pub fn write_json<T: Serialize, P: AsRef<Path>>( path: P, value: &T ) -> Result<()> {
    let mut writer = BufWriter::new( File::create( path.as_ref() )? );
    serde_json::to_writer_pretty( &mut writer, value )?;
    writeln!( writer )?;
    writer.flush()?;
    Ok( () )
}

#[cfg(test)]
mod test {
    use super::*;

    const TABLE: &str = "\
Site,Date,Sunset,Sunrise,AllBats,LowF,HighF,Precip,Temp,Jday,Habitat,ForestType,Burn,Fire
S1,2016-06-01,20:41,05:32,12,7,5,0.0,14.5,153,riparian,mixed,Burn,Pre
S1,07/15/2018,,,3,1,2,1.2,17.0,196,riparian,mixed,Burn,Post
";

    #[test]
    fn test_read() {
	let observations = read_observations( TABLE.as_bytes() ).unwrap();
	assert_eq!( observations.len(), 2 );
	let (row, first) = &observations[ 0 ];
	assert_eq!( *row, 2 );
	assert_eq!( first.counts, Counts{ all_bats: 12, low_frequency: 7, high_frequency: 5 });
	assert_eq!( first.sunset, NaiveTime::from_hms_opt( 20, 41, 0 ));
	let (_, second) = &observations[ 1 ];
	assert_eq!( second.date, NaiveDate::from_ymd_opt( 2018, 7, 15 ).unwrap() );
	assert_eq!( second.sunrise, None );
	assert_eq!( second.fire_period, "Post" );
    }

    #[test]
    fn test_bad_date() {
	let table = TABLE.replace( "07/15/2018", "15.7.2018" );
	match read_observations( table.as_bytes() ) {
	    Err( AnalysisError::Parse{ field, row, .. } ) => {
		assert_eq!( field, "Date" );
		assert_eq!( row, 3 );
	    },
	    other => panic!( "unexpected {other:?}" ),
	}
	let table = TABLE.replace( ",12,", ",twelve," );
	assert!( matches!( read_observations( table.as_bytes() ), Err( AnalysisError::Csv( _ ))));
    }

    #[test]
    fn test_observations_survive_writing() {
	let path = std::env::temp_dir().join( format!( "batfire-io-{}.csv", std::process::id() ));
	let observations: Vec<Observation> = read_observations( TABLE.as_bytes() ).unwrap().into_iter().map( |(_, o)| o ).collect();
	write_observations( &path, &observations ).unwrap();
	let reread: Vec<Observation> = read_observations_from( &path ).unwrap().into_iter().map( |(_, o)| o ).collect();
	std::fs::remove_file( &path ).unwrap();
	assert_eq!( reread, observations );
    }
}
