pub use kairos_core::*;

use miette::Diagnostic;
use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("storage error: {0}")]
    StoreError(#[from] StoreError),

    #[error("transition error: {0}")]
    TransitionError(#[from] TransitionError),

    #[error("sensitivity error: {0}")]
    SensitivityError(#[from] kairos_core::sensitivity::SensitivityError),

    #[error("repository error: {0}")]
    RepoError(#[from] crate::repo::RepoError),

    #[error("agent error: {0}")]
    AgentError(String),

    #[error("{0}")]
    Message(String),
}

impl Error {
    pub fn config(text: impl Display) -> Error {
        Error::ConfigError(text.to_string())
    }

    pub fn server(error: impl Display) -> Error {
        Error::ServerError(error.to_string())
    }

    pub fn agent(error: impl Display) -> Error {
        Error::AgentError(error.to_string())
    }

    pub fn message(text: impl Into<String>) -> Error {
        Error::Message(text.into())
    }
}
