/// 代理部署的收尾流程
/// 
/// 机器处于等待回调状态时由心跳触发：写入镜像，配置引导，重启并进入运行状态

use common::models::{BootOption, PowerAction, ProvisionEvent};
use common::ws_rpc::InstallBootloaderRequest;
use std::sync::Arc;
use tracing::{debug, info};

use super::continuation::AsyncContinuationHandler;
use super::error::DeployError;
use super::rollback::FailureRollbackPolicy;
use super::writer::DeployResult;
use crate::collaborators::{AgentClient, BootInterface, PowerController};
use crate::lock::MachineTask;

pub struct AgentDeployVendor {
    continuation: Arc<AsyncContinuationHandler>,
    rollback: Arc<FailureRollbackPolicy>,
    agent: Arc<dyn AgentClient>,
    boot: Arc<dyn BootInterface>,
    power: Arc<dyn PowerController>,
}

impl AgentDeployVendor {
    pub fn new(
        continuation: Arc<AsyncContinuationHandler>,
        rollback: Arc<FailureRollbackPolicy>,
        agent: Arc<dyn AgentClient>,
        boot: Arc<dyn BootInterface>,
        power: Arc<dyn PowerController>,
    ) -> Self {
        Self {
            continuation,
            rollback,
            agent,
            boot,
            power,
        }
    }

    /// 续部署并完成部署
    pub async fn continue_deploy(&self, task: &mut MachineTask) -> Result<DeployResult, DeployError> {
        task.require_exclusive_lock("continue_deploy")?;
        if let Err(e) = task.process_event(ProvisionEvent::Resume) {
            // 机器不在等待回调状态，不属于本次部署，只清理镜像
            self.rollback.discard_artifacts(task).await;
            return Err(e);
        }
        if let Err(e) = task.save().await {
            let message = format!("Failed to resume the deployment on machine {}. Error: {}", task.uuid(), e);
            return Err(self.rollback.fail(task, message).await);
        }
        debug!("Continuing the deployment on machine {}", task.uuid());

        let result = self
            .continuation
            .do_agent_iscsi_deploy(task, self.agent.as_ref())
            .await?;
        self.prepare_instance_to_boot(task, &result).await?;
        self.reboot_and_finish_deploy(task).await?;
        Ok(result)
    }

    /// 本地启动时安装引导程序，然后交给引导接口配置实例启动
    async fn prepare_instance_to_boot(
        &self,
        task: &mut MachineTask,
        result: &DeployResult,
    ) -> Result<(), DeployError> {
        let boot_option = match task.machine.boot_option() {
            Ok(option) => option,
            Err(e) => return Err(self.rollback.fail(task, e.to_string()).await),
        };

        // 整盘镜像自带引导程序
        if let (BootOption::Local, Some(root_uuid)) = (boot_option, result.root_uuid()) {
            let request = InstallBootloaderRequest {
                root_uuid: root_uuid.to_string(),
                efi_system_part_uuid: result.efi_system_partition_uuid().map(str::to_string),
            };
            let failure = match self.agent.install_bootloader(&task.machine, &request).await {
                Ok(outcome) if outcome.is_failed() => Some(outcome.error_text()),
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            };
            if let Some(error) = failure {
                let message = format!(
                    "Failed to install a bootloader when deploying machine {}. Error: {}",
                    task.uuid(),
                    error
                );
                return Err(self.rollback.fail(task, message).await);
            }
        }

        if let Err(e) = self.boot.prepare_instance(&task.machine).await {
            let message = format!(
                "Failed to prepare the machine {} to boot the instance. Error: {}",
                task.uuid(),
                e
            );
            return Err(self.rollback.fail(task, message).await);
        }
        Ok(())
    }

    async fn reboot_and_finish_deploy(&self, task: &mut MachineTask) -> Result<(), DeployError> {
        if let Err(e) = self.power.power_action(&task.machine, PowerAction::Reboot).await {
            let message = format!(
                "Error rebooting machine {} after deploy. Error: {}",
                task.uuid(),
                e
            );
            return Err(self.rollback.fail(task, message).await);
        }

        task.process_event(ProvisionEvent::Done)?;
        task.machine.target_provision_state = None;
        task.save().await?;
        info!("Deployment to machine {} done", task.uuid());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::image_file_path;
    use crate::machine::{Machine, MachineStore};
    use crate::test_support::Harness;
    use async_trait::async_trait;
    use common::models::ProvisionState;
    use common::ws_rpc::CommandStatus;
    use uuid::Uuid;

    async fn waiting_task(harness: &Harness, boot_option: &str) -> MachineTask {
        let mut machine = harness.partition_machine(ProvisionState::DeployWait);
        machine.instance_info.capabilities.boot_option = Some(boot_option.to_string());
        let task = harness.exclusive_task(machine).await;
        harness.artifacts.cache_instance_image(&task.machine).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_local_boot_deploy_reaches_active() {
        let harness = Harness::new();
        harness.partition_writer.returns(DeployResult::Partition {
            root_uuid: Some("root-1".to_string()),
            efi_system_partition_uuid: Some(Some("efi-1".to_string())),
        });
        let mut task = waiting_task(&harness, "local").await;

        harness.vendor.continue_deploy(&mut task).await.unwrap();

        let request = harness.agent.bootloader_requests().pop().unwrap();
        assert_eq!(request.root_uuid, "root-1");
        assert_eq!(request.efi_system_part_uuid.as_deref(), Some("efi-1"));
        assert_eq!(harness.boot.calls(), vec!["prepare_instance"]);
        assert_eq!(harness.power.actions(), vec![(task.uuid(), PowerAction::Reboot)]);

        let saved = harness.load(&task.uuid()).await;
        assert_eq!(saved.provision_state, ProvisionState::Active);
        assert_eq!(saved.driver_internal_info.root_uuid_or_disk_id.as_deref(), Some("root-1"));
    }

    #[tokio::test]
    async fn test_netboot_skips_bootloader() {
        let harness = Harness::new();
        let mut task = waiting_task(&harness, "netboot").await;

        harness.vendor.continue_deploy(&mut task).await.unwrap();
        assert!(harness.agent.bootloader_requests().is_empty());
        assert_eq!(harness.load(&task.uuid()).await.provision_state, ProvisionState::Active);
    }

    #[tokio::test]
    async fn test_bootloader_failure_fails_deploy() {
        let harness = Harness::new();
        harness.agent.set_bootloader_status(CommandStatus::Failed);
        let mut task = waiting_task(&harness, "local").await;

        let err = harness.vendor.continue_deploy(&mut task).await.unwrap_err();
        assert!(matches!(err, DeployError::DeployFailure(ref msg) if msg.contains("bootloader")));

        let saved = harness.load(&task.uuid()).await;
        assert_eq!(saved.provision_state, ProvisionState::DeployFailed);
        assert_eq!(harness.power.actions(), vec![(task.uuid(), PowerAction::PowerOff)]);
    }

    #[tokio::test]
    async fn test_requires_wait_state() {
        let harness = Harness::new();
        let machine = harness.partition_machine(ProvisionState::Active);
        let mut task = harness.exclusive_task(machine).await;
        harness.artifacts.cache_instance_image(&task.machine).await.unwrap();

        assert!(matches!(
            harness.vendor.continue_deploy(&mut task).await,
            Err(DeployError::InvalidState { .. })
        ));
        assert!(harness.agent.iscsi_requests().is_empty());
        assert!(!image_file_path(&harness.config, &task.uuid()).exists());
        assert_eq!(harness.load(&task.uuid()).await.provision_state, ProvisionState::Active);
        assert!(harness.power.actions().is_empty());
    }

    /// 能读取但无法写回的存储
    struct ReadOnlyStore(Arc<dyn MachineStore>);

    #[async_trait]
    impl MachineStore for ReadOnlyStore {
        async fn load(&self, uuid: &Uuid) -> common::Result<Machine> {
            self.0.load(uuid).await
        }

        async fn save(&self, _machine: &Machine) -> common::Result<()> {
            Err(common::Error::Database("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_resume_save_failure_rolls_back() {
        let harness = Harness::new();
        let machine = harness.partition_machine(ProvisionState::DeployWait);
        let uuid = machine.uuid;
        harness.insert(machine).await;
        let store: Arc<dyn MachineStore> = Arc::new(ReadOnlyStore(harness.store.clone()));
        let mut task = MachineTask::exclusive(&harness.locks, store, &uuid).await.unwrap();
        harness.artifacts.cache_instance_image(&task.machine).await.unwrap();

        let err = harness.vendor.continue_deploy(&mut task).await.unwrap_err();
        assert!(matches!(err, DeployError::DeployFailure(ref msg) if msg.contains("connection reset")));
        assert_eq!(task.machine.provision_state, ProvisionState::DeployFailed);
        assert!(!image_file_path(&harness.config, &uuid).exists());
        assert!(harness.agent.iscsi_requests().is_empty());
    }
}
