//! Error types for symbolic-diffusion-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// MIDI parsing error.
    #[error("midi: {0}")]
    Midi(String),

    /// Dataset construction or label mapping error.
    #[error("dataset: {0}")]
    Dataset(String),

    /// Training diverged or reached an unusable state.
    #[error("training: {0}")]
    Training(String),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Requested mode or input combination is not supported.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<midly::Error> for Error {
    fn from(error: midly::Error) -> Self {
        Error::Midi(error.to_string())
    }
}
