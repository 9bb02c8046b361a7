/// Agent RPC 错误定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// RPC 错误码
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorCode {
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Timeout,
    ConnectionClosed,
    SerializationError,

    AgentNotConnected,
    CommandFailed,
}

impl RpcErrorCode {
    /// 转换为字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::AgentNotConnected => "AGENT_NOT_CONNECTED",
            Self::CommandFailed => "COMMAND_FAILED",
        }
    }

    /// 从字符串码还原，未知码归为内部错误
    pub fn from_code(code: &str) -> Self {
        match code {
            "INVALID_REQUEST" => Self::InvalidRequest,
            "METHOD_NOT_FOUND" => Self::MethodNotFound,
            "INVALID_PARAMS" => Self::InvalidParams,
            "TIMEOUT" => Self::Timeout,
            "CONNECTION_CLOSED" => Self::ConnectionClosed,
            "SERIALIZATION_ERROR" => Self::SerializationError,
            "AGENT_NOT_CONNECTED" => Self::AgentNotConnected,
            "COMMAND_FAILED" => Self::CommandFailed,
            _ => Self::InternalError,
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC 错误
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Timeout, message)
    }

    pub fn connection_closed() -> Self {
        Self::new(RpcErrorCode::ConnectionClosed, "connection closed")
    }

    pub fn serialization_error(err: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::SerializationError,
            format!("serialization error: {}", err),
        )
    }

    /// 机器上的 Agent 未连接
    pub fn agent_not_connected(machine_id: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::AgentNotConnected,
            format!("no agent connected for machine {}", machine_id),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error(err)
    }
}

impl From<RpcError> for crate::Error {
    fn from(err: RpcError) -> Self {
        crate::Error::Agent(err.to_string())
    }
}
