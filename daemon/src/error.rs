use crate::protocol::RpcResponse;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Custom(String),

    #[error("no daemon instances configured")]
    NoInstances,

    #[error("daemon transport error: {0}")]
    Transport(String),

    #[error("daemon instances failed to initialize: {}", describe_failures(.0))]
    Offline(Vec<RpcResponse>),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::Custom(err)
    }
}

fn describe_failures(failures: &[RpcResponse]) -> String {
    serde_json::to_string(failures).unwrap_or_else(|_| format!("{} failed instance(s)", failures.len()))
}

pub type Result<T> = std::result::Result<T, Error>;
