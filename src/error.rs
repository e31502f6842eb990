use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("bus error: {0}")]
    Bus(#[from] lapin::Error),

    #[error("persistence transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("missing configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
