//! Top-level error type chaining every layer's structured error (spec.md
//! §7 "exceptions for control flow -> result types").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] common_store::StoreError),

    #[error(transparent)]
    Branch(#[from] common_branch::BranchError),

    #[error(transparent)]
    Tx(#[from] common_tx::TxError),

    #[error(transparent)]
    Schema(#[from] common_schema::SchemaError),

    #[error(transparent)]
    Cell(#[from] common_cell::CellError),

    #[error(transparent)]
    Scheduler(#[from] common_scheduler::SchedulerError),

    #[error(transparent)]
    Runner(#[from] common_runner::RunnerError),

    #[error(transparent)]
    Client(#[from] common_client::ClientError),

    #[error("sled storage error: {0}")]
    Sled(#[from] sled::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
