/// WebSocket 模块
/// 
/// 部署代理通过 WebSocket 注册、发送心跳并接收部署命令

pub mod agent_client;
pub mod agent_manager;
pub mod handler;

pub use agent_client::WsAgentClient;
pub use agent_manager::{AgentConnection, AgentConnectionManager};
pub use handler::handle_agent_websocket;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// 代理接入路径
pub const AGENT_WS_PATH: &str = "/v1/agent/ws";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(AGENT_WS_PATH, get(handle_agent_websocket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
