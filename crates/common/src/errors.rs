use thiserror::Error;

/// 统一错误类型
///
/// 外部协作者（电源控制、启动配置、镜像存储、Agent RPC 等）返回的错误
#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("power control error: {0}")]
    Power(String),

    #[error("boot configuration error: {0}")]
    Boot(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
