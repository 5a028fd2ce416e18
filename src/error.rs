use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::dependency::DependencyError;
use crate::model::EvaluationError;
use crate::pipeline::PipelineError;
use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
