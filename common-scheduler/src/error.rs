use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler did not converge after {iterations} waves in one run() call")]
    NonConvergence { iterations: u32 },
    #[error("unknown action id {0:?}")]
    UnknownAction(crate::ActionId),
    #[error("unknown run id {0:?}")]
    UnknownRun(crate::RunId),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
