use thiserror::Error;
use welltrack_core::CoreError;
use welltrack_protocol::ItemId;
use welltrack_supervisor::SupervisorError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("no analysis session is open")]
    NoActiveSession,
    #[error("item {0} is not part of the current session")]
    UnknownItem(ItemId),
    #[error("the coordinator has shut down")]
    Shutdown,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
