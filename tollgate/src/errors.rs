use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Catalog file could not be read from disk
    #[error("failed to read catalog file {path}")]
    CatalogIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Catalog rows could not be deserialized
    #[error("failed to parse catalog rows: {0}")]
    CatalogParse(#[from] serde_json::Error),

    /// Configuration file or environment overrides were invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Simulator filters matched no provider/model combinations
    #[error("no provider/model combinations matched the given filters")]
    NoCombos,

    /// Simulator produced no runs (no price cards for the selected combinations)
    #[error("price cards could not be loaded for the selected combinations")]
    NoRuns,

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Type alias for crate operation results
pub type Result<T> = std::result::Result<T, Error>;
