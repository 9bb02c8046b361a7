/// 部署代理 WebSocket 连接处理器

use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use common::ws_rpc::{
    methods, CleanStepsNotification, HeartbeatNotification, MessageType, RegisterRequest,
    RegisterResponse, RpcErrorCode, RpcMessage,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::agent_manager::AgentConnection;
use crate::app_state::AppState;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket 升级处理器
pub async fn handle_agent_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_connection(socket, state))
}

async fn handle_agent_connection(socket: WebSocket, state: AppState) {
    debug!("New agent WebSocket connection");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();

    let (request_id, register_req) = match wait_for_registration(&mut ws_receiver, &state).await {
        Ok(registration) => registration,
        Err(e) => {
            error!("Agent registration failed: {}", e);
            let _ = ws_sender.close().await;
            return;
        }
    };

    let register_response = RegisterResponse {
        success: true,
        message: "registered".to_string(),
    };
    let response = match serde_json::to_value(&register_response) {
        Ok(payload) => RpcMessage::response(request_id, payload),
        Err(e) => {
            error!("Failed to encode register response: {}", e);
            return;
        }
    };
    if let Err(e) = send_message(&mut ws_sender, response).await {
        error!("Failed to send register response: {}", e);
        return;
    }

    let connection = state
        .agent_manager
        .register(register_req.machine_id, register_req.agent_url.clone(), tx)
        .await;
    info!(
        "Agent connected: machine={}, agent_url={}",
        register_req.machine_id, register_req.agent_url
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_message(&mut ws_sender, msg).await {
                error!("Failed to send message to agent: {}", e);
                break;
            }
        }
    });

    let recv_connection = connection.clone();
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if let Err(e) = handle_incoming_message(msg, &recv_connection, &recv_state).await {
                        warn!("Failed to handle agent message: {}", e);
                    }
                }
                Err(e) => {
                    error!("Agent WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.agent_manager.unregister(&connection).await;
    info!("Agent connection closed: {}", connection.machine_id);
}

/// 第一条消息必须是注册请求，且机器必须已登记
async fn wait_for_registration(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<(String, RegisterRequest), String> {
    let msg = match tokio::time::timeout(REGISTRATION_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => return Err(format!("failed to receive register message: {}", e)),
        Ok(None) => return Err("connection closed".to_string()),
        Err(_) => return Err("timed out waiting for register message".to_string()),
    };

    let rpc_msg = parse_websocket_message(msg)?;
    if rpc_msg.message_type != MessageType::Request || rpc_msg.method.as_deref() != Some(methods::REGISTER) {
        return Err(format!("expected a register request, got {:?}", rpc_msg.method));
    }

    let register_req: RegisterRequest = rpc_msg
        .decode_payload()
        .map_err(|e| format!("invalid register payload: {}", e))?;

    state
        .store
        .load(&register_req.machine_id)
        .await
        .map_err(|e| format!("unknown machine {}: {}", register_req.machine_id, e))?;

    Ok((rpc_msg.id, register_req))
}

async fn handle_incoming_message(
    ws_msg: AxumWsMessage,
    connection: &Arc<AgentConnection>,
    state: &AppState,
) -> Result<(), String> {
    let rpc_msg = parse_websocket_message(ws_msg)?;
    debug!(
        "Agent message: type={:?}, method={:?}, id={}",
        rpc_msg.message_type, rpc_msg.method, rpc_msg.id
    );

    match rpc_msg.message_type {
        MessageType::Notification => handle_notification(rpc_msg, connection, state).await,
        MessageType::Response => {
            connection.handle_response(rpc_msg).await;
            Ok(())
        }
        MessageType::Request => {
            let method = rpc_msg.method.unwrap_or_default();
            warn!("Unknown request method from agent: {}", method);
            let error_response = RpcMessage::error_response(
                rpc_msg.id,
                RpcErrorCode::MethodNotFound.as_str(),
                format!("method not found: {}", method),
                None,
            );
            connection
                .sender
                .send(error_response)
                .map_err(|_| "failed to send error response".to_string())
        }
    }
}

/// 心跳与清理步骤在独立任务中处理，接收循环需要继续读取续部署期间代理的响应
async fn handle_notification(
    msg: RpcMessage,
    connection: &Arc<AgentConnection>,
    state: &AppState,
) -> Result<(), String> {
    let method = msg.method.as_deref().ok_or("notification without method")?;

    match method {
        methods::HEARTBEAT => {
            connection.update_heartbeat().await;
            let mut beat: HeartbeatNotification = msg.decode_payload().map_err(|e| e.to_string())?;
            if beat.machine_id != connection.machine_id {
                return Err(format!(
                    "heartbeat for machine {} on connection of machine {}",
                    beat.machine_id, connection.machine_id
                ));
            }
            if beat.agent_url.is_none() {
                beat.agent_url = Some(connection.agent_url.clone());
            }

            let dispatcher = state.dispatcher.clone();
            tokio::spawn(async move {
                let outcome = dispatcher.on_heartbeat(beat).await;
                debug!("Heartbeat handled: {:?}", outcome);
            });
            Ok(())
        }
        methods::CLEAN_STEPS => {
            let notification: CleanStepsNotification = msg.decode_payload().map_err(|e| e.to_string())?;
            if notification.machine_id != connection.machine_id {
                return Err(format!(
                    "clean steps for machine {} on connection of machine {}",
                    notification.machine_id, connection.machine_id
                ));
            }

            let dispatcher = state.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.on_clean_steps(notification).await;
            });
            Ok(())
        }
        _ => {
            warn!("Unknown notification method from agent: {}", method);
            Ok(())
        }
    }
}

fn parse_websocket_message(ws_msg: AxumWsMessage) -> Result<RpcMessage, String> {
    match ws_msg {
        AxumWsMessage::Text(text) => {
            RpcMessage::from_json(&text).map_err(|e| format!("invalid JSON: {}", e))
        }
        AxumWsMessage::Binary(data) => {
            let text = String::from_utf8(data).map_err(|e| format!("binary message is not UTF-8: {}", e))?;
            RpcMessage::from_json(&text).map_err(|e| format!("invalid JSON: {}", e))
        }
        AxumWsMessage::Close(_) => Err("connection closed".to_string()),
        _ => Err("unsupported message type".to_string()),
    }
}

async fn send_message(sender: &mut SplitSink<WebSocket, AxumWsMessage>, msg: RpcMessage) -> Result<(), String> {
    let json = msg.to_json().map_err(|e| format!("failed to encode message: {}", e))?;
    sender
        .send(AxumWsMessage::Text(json))
        .await
        .map_err(|e| format!("failed to send WebSocket message: {}", e))
}
