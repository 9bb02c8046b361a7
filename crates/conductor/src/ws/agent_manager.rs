/// 部署代理连接管理器
/// 
/// 每台机器的 ramdisk 代理通过一条 WebSocket 连接接入，按机器 UUID 索引

use common::ws_rpc::{RpcError, RpcErrorCode, RpcMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 等待响应的请求
type PendingRequest = oneshot::Sender<Result<RpcMessage, RpcError>>;

/// 代理连接
pub struct AgentConnection {
    pub machine_id: Uuid,
    /// 代理自报的回调地址
    pub agent_url: String,
    pub sender: mpsc::UnboundedSender<RpcMessage>,
    pub last_heartbeat: Arc<RwLock<Instant>>,
    /// request_id -> 响应发送端
    pending_requests: Arc<RwLock<HashMap<String, PendingRequest>>>,
}

impl AgentConnection {
    /// 发送请求并等待响应，超时后放弃
    pub async fn call(
        &self,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let method = method.into();
        let msg = RpcMessage::request(&method, payload);
        let request_id = msg.id.clone();

        info!("[conductor -> agent] request: machine={}, method={}, id={}", self.machine_id, method, request_id);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_requests.write().await;
            pending.insert(request_id.clone(), tx);
        }

        if self.sender.send(msg).is_err() {
            let mut pending = self.pending_requests.write().await;
            pending.remove(&request_id);
            return Err(RpcError::connection_closed());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                let mut pending = self.pending_requests.write().await;
                pending.remove(&request_id);
                Err(RpcError::new(RpcErrorCode::InternalError, "response channel closed"))
            }
            Err(_) => {
                let mut pending = self.pending_requests.write().await;
                pending.remove(&request_id);
                Err(RpcError::timeout(format!(
                    "request {} ({}) to machine {} timed out after {}s",
                    request_id,
                    method,
                    self.machine_id,
                    timeout.as_secs()
                )))
            }
        }
    }

    /// 把代理的响应交给等待中的请求
    pub async fn handle_response(&self, response: RpcMessage) {
        let request_id = response.id.clone();

        let sender = {
            let mut pending = self.pending_requests.write().await;
            pending.remove(&request_id)
        };

        let Some(sender) = sender else {
            debug!("Unexpected response {} from machine {}", request_id, self.machine_id);
            return;
        };

        let result = match response.error {
            Some(error_info) => {
                warn!(
                    "[agent -> conductor] error response: machine={}, id={}, code={}, message={}",
                    self.machine_id, request_id, error_info.code, error_info.message
                );
                Err(RpcError::new(RpcErrorCode::from_code(&error_info.code), error_info.message))
            }
            None => {
                debug!("[agent -> conductor] response: machine={}, id={}", self.machine_id, request_id);
                Ok(response)
            }
        };

        if sender.send(result).is_err() {
            warn!("Caller of request {} is gone", request_id);
        }
    }

    pub async fn update_heartbeat(&self) {
        let mut last_heartbeat = self.last_heartbeat.write().await;
        *last_heartbeat = Instant::now();
    }

    pub async fn heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.read().await.elapsed()
    }
}

/// 代理连接管理器
#[derive(Clone, Default)]
pub struct AgentConnectionManager {
    connections: Arc<RwLock<HashMap<Uuid, Arc<AgentConnection>>>>,
}

impl AgentConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接，同一台机器的旧连接被替换
    pub async fn register(
        &self,
        machine_id: Uuid,
        agent_url: String,
        sender: mpsc::UnboundedSender<RpcMessage>,
    ) -> Arc<AgentConnection> {
        let connection = Arc::new(AgentConnection {
            machine_id,
            agent_url,
            sender,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
        });

        let mut connections = self.connections.write().await;
        if connections.insert(machine_id, connection.clone()).is_some() {
            info!("Agent on machine {} reconnected", machine_id);
        } else {
            info!("Agent registered: {}", machine_id);
        }
        connection
    }

    /// 注销连接；连接已被新连接替换时不做任何事
    pub async fn unregister(&self, connection: &Arc<AgentConnection>) {
        let mut connections = self.connections.write().await;
        if connections
            .get(&connection.machine_id)
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            connections.remove(&connection.machine_id);
            info!("Agent unregistered: {}", connection.machine_id);
        }
    }

    pub async fn get(&self, machine_id: &Uuid) -> Option<Arc<AgentConnection>> {
        let connections = self.connections.read().await;
        connections.get(machine_id).cloned()
    }

    pub async fn is_connected(&self, machine_id: &Uuid) -> bool {
        let connections = self.connections.read().await;
        connections.contains_key(machine_id)
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 向机器上的代理发送请求
    pub async fn call(
        &self,
        machine_id: &Uuid,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let connection = self
            .get(machine_id)
            .await
            .ok_or_else(|| RpcError::agent_not_connected(machine_id))?;

        connection.call(method, payload, timeout).await
    }
}
