use crate::collaborator::CollaboratorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("not initialized: run 'scirecipe config init'")]
    NotInitialized,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown qa type '{0}'")]
    UnknownQaType(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RecipeError>;
