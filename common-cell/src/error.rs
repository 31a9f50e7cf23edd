//! Error taxonomy for the cell layer (spec.md §7: cell reads never throw
//! for missing data; only structural copy-traps and write failures do).

use common_path::Entity;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CellError {
    #[error("set/update/push called on a cell with no open transaction")]
    NoOpenTx,

    #[error("write redirected through {0} but the target is not writable in this context")]
    UnwritableRedirect(Entity),

    #[error(transparent)]
    Branch(#[from] common_branch::BranchError),

    #[error(transparent)]
    Tx(#[from] common_tx::TxError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CellError>;
