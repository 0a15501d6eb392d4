use thiserror::Error;

use crate::catalog::CatalogError;
use crate::decoder::DecodeError;
use crate::dispatch::DispatchError;
use crate::durable::DurableError;
use crate::frontier::OrchestratorError;
use crate::model::ModelError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Durable error: {0}")]
    Durable(#[from] DurableError),
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SaitenResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
