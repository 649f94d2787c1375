
use thiserror::Error;

/// Everything that can stop a preparation, fit or selection.
/// Non-convergence is not in here, it is a status of the fitted model.
#[derive( Debug, Error )]
pub enum AnalysisError {
    #[error( "row {row}: field {field} has unexpected category '{value}'" )]
    MalformedCategory { field: &'static str, value: String, row: usize },

    #[error( "covariate {covariate} is constant in the prepared frame (sd = 0)" )]
    DegenerateCovariance { covariate: String },

    #[error( "grouping factor {factor} has {observed} observed level(s), need at least 2" )]
    InsufficientGroups { factor: String, observed: usize },

    #[error( "no candidate model could be fitted ({excluded} excluded)" )]
    NoCandidate { excluded: usize },

    #[error( "none of the {failed} analysis run(s) succeeded" )]
    NoSuccessfulRun { failed: usize },

    #[error( "numerical failure: {0}" )]
    Numerical( String ),

    #[error( "row {row}: cannot parse {field}: {message}" )]
    Parse { field: &'static str, row: usize, message: String },

    #[error( "configuration: {0}" )]
    Config( String ),

    #[error( transparent )]
    Io( #[from] std::io::Error ),

    #[error( transparent )]
    Csv( #[from] csv::Error ),

    #[error( transparent )]
    Json( #[from] serde_json::Error ),

    #[error( transparent )]
    Toml( #[from] toml::de::Error ),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
