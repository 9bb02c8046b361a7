/// 部署状态机
/// 
/// 集群管理器按机器调用的公开操作。部署只负责发起，机器进入等待回调状态后
/// 由代理心跳触发续部署

use common::models::{PowerAction, ProvisionState};
use common::ws_rpc::CleanStep;
use std::sync::Arc;
use tracing::{debug, info};

use super::cleaning::InbandCleaning;
use super::error::DeployError;
use super::params::parse_instance_info;
use super::ramdisk::{build_agent_options, resolve_api_url};
use crate::collaborators::{BootInterface, NetworkProvider, PowerController, ServiceCatalog};
use crate::config::DeployConfig;
use crate::images::ImageArtifacts;
use crate::lock::MachineTask;
use crate::machine::{parse_root_device_hints, validate_capabilities, Machine};

pub struct DeploymentOrchestrator {
    config: Arc<DeployConfig>,
    boot: Arc<dyn BootInterface>,
    power: Arc<dyn PowerController>,
    network: Arc<dyn NetworkProvider>,
    catalog: Arc<dyn ServiceCatalog>,
    artifacts: Arc<ImageArtifacts>,
    cleaning: InbandCleaning,
}

impl DeploymentOrchestrator {
    pub fn new(
        config: Arc<DeployConfig>,
        boot: Arc<dyn BootInterface>,
        power: Arc<dyn PowerController>,
        network: Arc<dyn NetworkProvider>,
        catalog: Arc<dyn ServiceCatalog>,
        artifacts: Arc<ImageArtifacts>,
        cleaning: InbandCleaning,
    ) -> Self {
        Self {
            config,
            boot,
            power,
            network,
            catalog,
            artifacts,
            cleaning,
        }
    }

    /// 校验部署前提，不修改机器
    pub async fn validate(&self, machine: &Machine) -> Result<(), DeployError> {
        self.boot.validate(machine).await?;
        validate_capabilities(machine)?;
        resolve_api_url(&self.config, self.catalog.as_ref()).await?;
        parse_root_device_hints(machine)?;
        parse_instance_info(machine, &self.config)?;
        debug!("Machine {} passed deploy validation", machine.uuid);
        Ok(())
    }

    /// 拉取镜像、检查大小并重启机器，返回等待回调状态
    ///
    /// 不等待代理心跳
    pub async fn deploy(&self, task: &mut MachineTask) -> Result<ProvisionState, DeployError> {
        task.require_exclusive_lock("deploy")?;

        self.artifacts.cache_instance_image(&task.machine).await?;
        self.artifacts.check_image_size(&task.machine).await?;
        self.power.power_action(&task.machine, PowerAction::Reboot).await?;

        info!("Machine {} rebooting into the deploy ramdisk", task.uuid());
        Ok(ProvisionState::DeployWait)
    }

    /// 关机，返回已删除状态；清理工作由 `clean_up` 完成
    pub async fn tear_down(&self, task: &mut MachineTask) -> Result<ProvisionState, DeployError> {
        task.require_exclusive_lock("tear_down")?;

        self.power.power_action(&task.machine, PowerAction::PowerOff).await?;
        info!("Machine {} powered off for tear down", task.uuid());
        Ok(ProvisionState::Deleted)
    }

    /// 已部署的机器配置实例启动，否则配置部署 ramdisk 启动
    pub async fn prepare(&self, task: &MachineTask) -> Result<(), DeployError> {
        if task.machine.provision_state == ProvisionState::Active {
            self.boot.prepare_instance(&task.machine).await?;
        } else {
            let options = build_agent_options(&self.config, self.catalog.as_ref(), &task.machine).await?;
            self.boot.prepare_ramdisk(&task.machine, &options).await?;
        }
        Ok(())
    }

    /// 删除本地镜像、引导配置与 DHCP 记录，可重复调用
    pub async fn clean_up(&self, task: &MachineTask) -> Result<(), DeployError> {
        self.artifacts.destroy_images(&task.uuid()).await;
        self.boot.clean_up_ramdisk(&task.machine).await?;
        self.boot.clean_up_instance(&task.machine).await?;
        self.network.clean_dhcp(&task.machine).await?;
        Ok(())
    }

    pub fn get_clean_steps(&self, machine: &Machine) -> Result<Vec<CleanStep>, DeployError> {
        self.cleaning.get_clean_steps(machine)
    }

    pub async fn execute_clean_step(
        &self,
        task: &mut MachineTask,
        step: &CleanStep,
    ) -> Result<ProvisionState, DeployError> {
        self.cleaning.execute_clean_step(task, step).await
    }

    pub async fn prepare_cleaning(&self, task: &mut MachineTask) -> Result<ProvisionState, DeployError> {
        self.cleaning.prepare_cleaning(task, true).await
    }

    pub async fn tear_down_cleaning(&self, task: &mut MachineTask) -> Result<(), DeployError> {
        self.cleaning.tear_down_cleaning(task, true).await
    }
}
