/// Agent RPC 模块
/// 
/// Conductor 与部署 Agent 之间基于 WebSocket 的 JSON 消息格式

pub mod message;
pub mod error;
pub mod types;

pub use message::{RpcMessage, MessageType};
pub use error::{RpcError, RpcErrorCode};
pub use types::*;
