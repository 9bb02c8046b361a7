/// 基于 WebSocket 连接的部署代理客户端

use async_trait::async_trait;
use common::ws_rpc::{
    methods, CleanStep, CommandResult, ExecuteCleanStepRequest, InstallBootloaderRequest,
    StartIscsiTargetRequest,
};
use common::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::AgentConnectionManager;
use crate::collaborators::AgentClient;
use crate::machine::Machine;

/// 每个命令都有超时，代理无响应时返回超时错误而不是一直等待
#[derive(Clone)]
pub struct WsAgentClient {
    manager: AgentConnectionManager,
    timeout: Duration,
}

impl WsAgentClient {
    pub fn new(manager: AgentConnectionManager, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    async fn command<T: Serialize + Sync>(&self, machine: &Machine, method: &str, request: &T) -> Result<CommandResult> {
        let payload = serde_json::to_value(request)?;
        let response = self
            .manager
            .call(&machine.uuid, method, payload, self.timeout)
            .await?;
        let result: CommandResult = response.decode_payload()?;
        debug!(
            "Agent command {} on machine {} finished with status {:?}",
            method, machine.uuid, result.command_status
        );
        Ok(result)
    }
}

#[async_trait]
impl AgentClient for WsAgentClient {
    async fn start_iscsi_target(
        &self,
        machine: &Machine,
        request: &StartIscsiTargetRequest,
    ) -> Result<CommandResult> {
        self.command(machine, methods::START_ISCSI_TARGET, request).await
    }

    async fn install_bootloader(
        &self,
        machine: &Machine,
        request: &InstallBootloaderRequest,
    ) -> Result<CommandResult> {
        self.command(machine, methods::INSTALL_BOOTLOADER, request).await
    }

    async fn execute_clean_step(&self, machine: &Machine, step: &CleanStep) -> Result<CommandResult> {
        let request = ExecuteCleanStepRequest { step: step.clone() };
        self.command(machine, methods::EXECUTE_CLEAN_STEP, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::ProvisionState;
    use common::ws_rpc::{CommandStatus, RpcMessage};
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_start_iscsi_target_over_connection() {
        let manager = AgentConnectionManager::new();
        let machine = Machine::new(Uuid::new_v4(), ProvisionState::Deploying);
        let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();
        let connection = manager.register(machine.uuid, "http://10.0.0.9:9999".to_string(), tx).await;

        let agent = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.method.as_deref(), Some("start_iscsi_target"));
            let payload: StartIscsiTargetRequest = request.decode_payload().unwrap();
            connection
                .handle_response(RpcMessage::response(
                    request.id,
                    json!({
                        "command_name": "iscsi.start_iscsi_target",
                        "command_status": "SUCCEEDED",
                        "command_result": {"iscsi_target_iqn": payload.iqn},
                    }),
                ))
                .await;
        });

        let client = WsAgentClient::new(manager, Duration::from_secs(5));
        let request = StartIscsiTargetRequest {
            iqn: common::utils::iscsi_iqn(&machine.uuid),
            portal_port: 3260,
            wipe_disk_metadata: true,
        };
        let result = client.start_iscsi_target(&machine, &request).await.unwrap();
        agent.await.unwrap();

        assert_eq!(result.command_status, CommandStatus::Succeeded);
        assert!(!result.is_failed());
    }

    #[tokio::test]
    async fn test_disconnected_agent_is_an_error() {
        let client = WsAgentClient::new(AgentConnectionManager::new(), Duration::from_secs(1));
        let machine = Machine::new(Uuid::new_v4(), ProvisionState::Deploying);

        let err = client
            .install_bootloader(
                &machine,
                &InstallBootloaderRequest {
                    root_uuid: "abc".to_string(),
                    efi_system_part_uuid: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, common::Error::Agent(_)));
    }
}
