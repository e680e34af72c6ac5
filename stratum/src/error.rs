use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("{0} hashing is performed by the external share validator")]
    UnsupportedHash(String),

    #[error("Merged mining is not supported with coins that pass an extra coinbase payload.")]
    MergedMiningPayload,

    #[error("invalid block template: {0}")]
    Template(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
