
use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::*;

use batfire::*;
use batfire::data::{DataPreparer, Numeric, describe_sites};
use batfire::io::{read_observations_from, write_csv, write_json, write_observations};
use batfire::simulate::{Simulation, simulate};

#[derive( Parser )]
#[command( name = "batfire", about = "Before-after control-impact models of bat activity around a wildfire" )]
struct Cli {
    /// more output, repeat for debug and trace
    #[arg( short, long, action = clap::ArgAction::Count, global = true )]
    verbose: u8,

    #[command( subcommand )]
    command: Command,
}

#[derive( Subcommand )]
enum Command {
    /// Fit, select and summarise every configured response and partition
    Run {
	/// survey table
	data: PathBuf,
	/// TOML analysis settings, study defaults if absent
	#[arg( short, long )]
	config: Option<PathBuf>,
	#[arg( short, long, default_value = "results" )]
	output: PathBuf,
    },
    /// Write the per-site description table
    Describe {
	data: PathBuf,
	#[arg( short, long, default_value = "sites.csv" )]
	output: PathBuf,
    },
    /// Write a synthetic survey with known effects
    Simulate {
	#[arg( short, long, default_value = "simulated.csv" )]
	output: PathBuf,
	#[arg( long, default_value_t = 12 )]
	sites: usize,
	#[arg( long, default_value_t = 8 )]
	nights: usize,
	#[arg( long, default_value_t = 42 )]
	seed: u64,
    },
}

fn prepare_logging( verbose: u8 ) {
    let level = match verbose {
	0 => tracing_subscriber::filter::LevelFilter::WARN,
	1 => tracing_subscriber::filter::LevelFilter::INFO,
	2 => tracing_subscriber::filter::LevelFilter::DEBUG,
	_ => tracing_subscriber::filter::LevelFilter::TRACE,
    };
    let tracer = tracing_subscriber::fmt::fmt()
	.with_max_level( level )
	.with_writer( std::io::stderr )
	.finish();
    if let Err( err ) = tracing::subscriber::set_global_default( tracer ) {
	eprintln!( "logging unavailable: {err}" );
    }
}

fn run( data: PathBuf, config: Option<PathBuf>, output: PathBuf ) -> Result<(), AnalysisError> {
    let config = match config {
	Some( path ) => AnalysisConfig::from_file( path )?,
	None => AnalysisConfig::default(),
    };
    let observations = read_observations_from( &data )?;
    let pipeline = Pipeline::new( config, observations )?;
    let report = pipeline.run_all();

    fs::create_dir_all( &output )?;
    write_csv( output.join( "coefficients.csv" ), &report.coefficients() )?;
    write_csv( output.join( "predictions.csv" ), &report.predictions() )?;
    write_csv( output.join( "candidates.csv" ), &report.candidates() )?;
    if let Ok( full ) = pipeline.dataset( &Partition::full() ) {
	write_csv( output.join( "sites.csv" ), &describe_sites( &full ))?;
    }
    write_json( output.join( "report.json" ), &report )?;
    info!( "results written to {}", output.display() );
    report.ensure_any()
}

fn describe( data: PathBuf, output: PathBuf ) -> Result<(), AnalysisError> {
    let observations = read_observations_from( &data )?;
    let prepared = DataPreparer::new( Vec::<Numeric>::new() ).prepare( &observations )?;
    write_csv( &output, &describe_sites( &prepared ))
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();
    prepare_logging( cli.verbose );

    let result = match cli.command {
	Command::Run{ data, config, output } => run( data, config, output ),
	Command::Describe{ data, output } => describe( data, output ),
	Command::Simulate{ output, sites, nights, seed } => {
	    let simulation = Simulation{ sites, nights_per_year: nights, seed, ..Simulation::default() };
	    write_observations( &output, &simulate( &simulation ))
	},
    };
    result.map_err( |err| err.to_string() )
}
