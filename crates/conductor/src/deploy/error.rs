use common::models::{ProvisionEvent, ProvisionState};
use thiserror::Error;
use uuid::Uuid;

/// 部署核心错误类型
#[derive(Error, Debug)]
pub enum DeployError {
    /// 必需的部署参数为空，在任何 I/O 之前返回
    #[error("Parameters {0:?} were not passed for deploy")]
    MissingParameter(Vec<String>),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(
        "Root partition is too small for requested image. Image virtual size: {image_mb} MB, Root size: {root_mb} MB"
    )]
    OversizedImage { image_mb: u64, root_mb: u64 },

    /// 部署失败，回滚已完成
    #[error("{0}")]
    DeployFailure(String),

    #[error("Cleaning steps are not yet available: {0}")]
    CleaningNotAvailable(String),

    #[error("Cleaning failed: {0}")]
    CleaningFailure(String),

    /// 调用方未持有机器的排他锁
    #[error("{operation} requires an exclusive lock on machine {machine}")]
    LockNotHeld { machine: Uuid, operation: &'static str },

    #[error("Machine {0} is locked by another operation")]
    MachineLocked(Uuid),

    #[error("Event {event:?} is not allowed for machine {machine} in state '{state}'")]
    InvalidState {
        machine: Uuid,
        state: ProvisionState,
        event: ProvisionEvent,
    },

    #[error(transparent)]
    Collaborator(#[from] common::Error),
}
