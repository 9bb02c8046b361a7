/// 部署失败的统一处理

use common::models::{PowerAction, ProvisionEvent};
use std::sync::Arc;
use tracing::{error, warn};

use super::error::DeployError;
use crate::collaborators::PowerController;
use crate::config::DeployConfig;
use crate::images::ImageArtifacts;
use crate::lock::MachineTask;

/// 失败回滚策略
///
/// 记录错误、把机器置为部署失败、清理镜像，三者总是一起发生。
/// 清理过程中的次要错误只记录日志，不会覆盖主错误
pub struct FailureRollbackPolicy {
    config: Arc<DeployConfig>,
    power: Arc<dyn PowerController>,
    artifacts: Arc<ImageArtifacts>,
}

impl FailureRollbackPolicy {
    pub fn new(
        config: Arc<DeployConfig>,
        power: Arc<dyn PowerController>,
        artifacts: Arc<ImageArtifacts>,
    ) -> Self {
        Self {
            config,
            power,
            artifacts,
        }
    }

    /// 回滚并返回携带失败信息的部署错误
    pub async fn fail(&self, task: &mut MachineTask, message: impl Into<String>) -> DeployError {
        let message = message.into();
        self.roll_back(task, &message).await;
        DeployError::DeployFailure(message)
    }

    /// 执行回滚但不构造错误，调用方需要保留原始错误类型时使用
    pub async fn roll_back(&self, task: &mut MachineTask, message: &str) {
        error!(machine = %task.uuid(), "{}", message);
        self.set_failed_state(task, message).await;
        self.artifacts.destroy_images(&task.uuid()).await;
    }

    /// 只删除机器的镜像，不改变机器状态
    pub async fn discard_artifacts(&self, task: &MachineTask) {
        self.artifacts.destroy_images(&task.uuid()).await;
    }

    /// 把机器置为部署失败并记录错误信息，按配置尝试关机
    pub async fn set_failed_state(&self, task: &mut MachineTask, message: &str) {
        if let Err(e) = task.process_event(ProvisionEvent::Fail) {
            error!("Failed to move machine {} to the failed state: {}", task.uuid(), e);
        }

        if self.config.power_off_after_deploy_failure {
            if let Err(e) = self
                .power
                .power_action(&task.machine, PowerAction::PowerOff)
                .await
            {
                warn!(
                    "Failed to power off machine {} after deploy failure: {}",
                    task.uuid(),
                    e
                );
            }
        }

        task.machine.last_error = Some(message.to_string());
        task.machine.target_provision_state = None;
        if let Err(e) = task.save().await {
            error!("Failed to save failed state of machine {}: {}", task.uuid(), e);
        }
    }
}
