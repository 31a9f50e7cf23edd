use common_path::Entity;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("module ref {0:?} is not registered")]
    UnknownModuleRef(String),
    #[error("javascript implementation with fingerprint {0} has no registered function")]
    UnknownFunction(String),
    #[error("raw module factory {0:?} is not registered")]
    UnknownFactory(String),
    #[error("no active run for process cell {0}")]
    NoActiveRun(Entity),
    #[error(transparent)]
    Cell(#[from] common_cell::CellError),
    #[error(transparent)]
    Branch(#[from] common_branch::BranchError),
    #[error(transparent)]
    Tx(#[from] common_tx::TxError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
