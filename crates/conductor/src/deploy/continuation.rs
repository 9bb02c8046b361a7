/// 心跳驱动的续部署
/// 
/// 代理就绪后：构造部署参数、写入镜像、解析结果、记录磁盘布局、删除本地镜像，
/// 严格按此顺序执行。任何失败都经过回滚策略

use common::utils::{agent_host_from_url, iscsi_iqn};
use common::ws_rpc::StartIscsiTargetRequest;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::DeployError;
use super::ledger;
use super::params::{parse_instance_info, DeployParamBuilder, DeployTarget};
use super::rollback::FailureRollbackPolicy;
use super::writer::{DeployResult, ImageKind, ImageWriters};
use crate::collaborators::AgentClient;
use crate::config::DeployConfig;
use crate::images::ImageArtifacts;
use crate::lock::MachineTask;

/// 续部署处理器
///
/// 失败时回滚在返回前已经完成，返回的错误是本次尝试失败的权威信号
pub struct AsyncContinuationHandler {
    config: Arc<DeployConfig>,
    builder: DeployParamBuilder,
    writers: ImageWriters,
    rollback: Arc<FailureRollbackPolicy>,
    artifacts: Arc<ImageArtifacts>,
}

impl AsyncContinuationHandler {
    pub fn new(
        config: Arc<DeployConfig>,
        writers: ImageWriters,
        rollback: Arc<FailureRollbackPolicy>,
        artifacts: Arc<ImageArtifacts>,
    ) -> Self {
        Self {
            builder: DeployParamBuilder::new(config.clone()),
            config,
            writers,
            rollback,
            artifacts,
        }
    }

    fn instance_label(task: &MachineTask) -> String {
        task.machine
            .instance_uuid
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }

    /// 把镜像写入代理暴露出的磁盘
    pub async fn continue_deploy(
        &self,
        task: &mut MachineTask,
        target: DeployTarget,
    ) -> Result<DeployResult, DeployError> {
        task.require_exclusive_lock("continue_deploy")?;

        let params = match self.builder.build(&task.machine, &target) {
            Ok(params) => params,
            Err(e) => {
                let message = format!(
                    "Deploy failed for instance {}. Error: {}",
                    Self::instance_label(task),
                    e
                );
                self.rollback.roll_back(task, &message).await;
                return Err(e);
            }
        };

        // DeployParameters 的 Debug 会隐藏配置盘内容
        debug!("Continuing deployment for machine {}, params {:?}", task.uuid(), params);

        let kind = ImageKind::of(&task.machine);
        let result = match self.writers.write(kind, &params).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!(
                    "Deploy failed for instance {}. Error: {}",
                    Self::instance_label(task),
                    e
                );
                return Err(self.rollback.fail(task, message).await);
            }
        };

        if result.root_uuid_or_disk_id().is_none() {
            let message = format!(
                "Couldn't determine the UUID of the root partition or the disk identifier after deploying machine {} (instance {})",
                task.uuid(),
                Self::instance_label(task)
            );
            return Err(self.rollback.fail(task, message).await);
        }

        if params.preserve_ephemeral() {
            let saved = match parse_instance_info(&task.machine, &self.config)
                .map(|info| info.disk_layout())
            {
                Ok(Some(layout)) => ledger::save_disk_layout(task, layout).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = saved {
                let message = format!(
                    "Failed to save the disk layout of machine {} (instance {}). Error: {}",
                    task.uuid(),
                    Self::instance_label(task),
                    e
                );
                return Err(self.rollback.fail(task, message).await);
            }
        }

        self.artifacts.destroy_images(&task.uuid()).await;
        info!("Image written to machine {} ({:?})", task.uuid(), kind);
        Ok(result)
    }

    /// 基于部署代理的续部署：先让代理暴露 iSCSI 目标，再写入镜像
    ///
    /// 成功后把根分区 UUID 或磁盘标识保存到机器的内部信息
    pub async fn do_agent_iscsi_deploy(
        &self,
        task: &mut MachineTask,
        agent: &dyn AgentClient,
    ) -> Result<DeployResult, DeployError> {
        task.require_exclusive_lock("do_agent_iscsi_deploy")?;

        let preserve_ephemeral = task.machine.instance_info.preserve_ephemeral.unwrap_or(false);
        let iqn = iscsi_iqn(&task.uuid());
        let request = StartIscsiTargetRequest {
            iqn: iqn.clone(),
            portal_port: self.config.portal_port,
            wipe_disk_metadata: !preserve_ephemeral,
        };

        let failure = match agent.start_iscsi_target(&task.machine, &request).await {
            Ok(result) if result.is_failed() => Some(result.error_text()),
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };
        if let Some(error) = failure {
            let message = format!(
                "Failed to start the iSCSI target to deploy the machine {}. Error: {}",
                task.uuid(),
                error
            );
            return Err(self.rollback.fail(task, message).await);
        }

        let address = task
            .machine
            .driver_internal_info
            .agent_url
            .as_deref()
            .and_then(agent_host_from_url);

        let result = self.continue_deploy(task, DeployTarget::new(address, iqn)).await?;

        task.machine.driver_internal_info.root_uuid_or_disk_id =
            result.root_uuid_or_disk_id().map(str::to_string);
        task.save().await?;

        Ok(result)
    }
}
