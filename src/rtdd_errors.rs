use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtddError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed catalog: {0}")]
    MalformedCatalog(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cannot parse {0}")]
    Parse(String),

    #[error("External process failure: {0}")]
    Process(String),

    #[error("Insufficient number of neighbors for event {0} ({1} found)")]
    InsufficientNeighbors(String, usize),

    #[error("Relocation failed: {0}")]
    RelocationFailed(String),
}
