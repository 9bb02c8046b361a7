/// 带内清理
/// 
/// 清理步骤由部署代理上报并缓存在机器记录中；执行步骤是异步的，结果经心跳返回

use common::models::{PowerAction, ProvisionState};
use common::ws_rpc::CleanStep;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::DeployError;
use super::ramdisk::build_agent_options;
use crate::collaborators::{AgentClient, BootInterface, NetworkProvider, PowerController, ServiceCatalog};
use crate::config::DeployConfig;
use crate::lock::MachineTask;
use crate::machine::Machine;

/// 擦除磁盘的清理步骤名
pub const ERASE_DEVICES_STEP: &str = "erase_devices";

/// 读取代理上报的清理步骤，并应用优先级覆盖
///
/// 覆盖值为 `None` 时保留代理上报的优先级
pub fn agent_get_clean_steps(
    machine: &Machine,
    interface: &str,
    override_priorities: &HashMap<&str, Option<i32>>,
) -> Result<Vec<CleanStep>, DeployError> {
    let cached = machine
        .driver_internal_info
        .agent_cached_clean_steps
        .as_ref()
        .ok_or_else(|| {
            DeployError::CleaningNotAvailable(format!(
                "the agent on machine {} has not reported its clean steps",
                machine.uuid
            ))
        })?;

    let mut steps = cached.get(interface).cloned().unwrap_or_default();
    for step in &mut steps {
        if let Some(Some(priority)) = override_priorities.get(step.step.as_str()) {
            debug!(
                "Overriding priority of clean step {} on machine {}: {} -> {}",
                step.step, machine.uuid, step.priority, priority
            );
            step.priority = *priority;
        }
    }
    Ok(steps)
}

/// 由部署代理执行的清理流程
pub struct InbandCleaning {
    config: Arc<DeployConfig>,
    agent: Arc<dyn AgentClient>,
    boot: Arc<dyn BootInterface>,
    power: Arc<dyn PowerController>,
    network: Arc<dyn NetworkProvider>,
    catalog: Arc<dyn ServiceCatalog>,
}

impl InbandCleaning {
    pub fn new(
        config: Arc<DeployConfig>,
        agent: Arc<dyn AgentClient>,
        boot: Arc<dyn BootInterface>,
        power: Arc<dyn PowerController>,
        network: Arc<dyn NetworkProvider>,
        catalog: Arc<dyn ServiceCatalog>,
    ) -> Self {
        Self {
            config,
            agent,
            boot,
            power,
            network,
            catalog,
        }
    }

    /// 部署接口的清理步骤，擦盘步骤使用配置的优先级
    pub fn get_clean_steps(&self, machine: &Machine) -> Result<Vec<CleanStep>, DeployError> {
        let overrides = HashMap::from([(ERASE_DEVICES_STEP, self.config.erase_devices_priority)]);
        agent_get_clean_steps(machine, "deploy", &overrides)
    }

    /// 让代理异步执行一个清理步骤
    pub async fn execute_clean_step(
        &self,
        task: &mut MachineTask,
        step: &CleanStep,
    ) -> Result<ProvisionState, DeployError> {
        task.require_exclusive_lock("execute_clean_step")?;
        info!("Executing clean step {} on machine {}", step.step, task.uuid());

        let result = self
            .agent
            .execute_clean_step(&task.machine, step)
            .await
            .map_err(|e| {
                DeployError::CleaningFailure(format!(
                    "agent on machine {} failed to execute clean step {}: {}",
                    task.uuid(),
                    step.step,
                    e
                ))
            })?;

        if result.is_failed() {
            return Err(DeployError::CleaningFailure(format!(
                "agent on machine {} returned bad command result for clean step {}: {}",
                task.uuid(),
                step.step,
                result.error_text()
            )));
        }

        Ok(ProvisionState::CleanWait)
    }

    /// 接入清理网络并引导进部署 ramdisk
    pub async fn prepare_cleaning(
        &self,
        task: &mut MachineTask,
        manage_boot: bool,
    ) -> Result<ProvisionState, DeployError> {
        task.require_exclusive_lock("prepare_cleaning")?;

        self.remove_cleaning_ports(task).await?;
        let ports = self
            .network
            .add_cleaning_network(&task.machine)
            .await
            .map_err(|e| {
                DeployError::CleaningFailure(format!(
                    "failed to create cleaning ports for machine {}: {}",
                    task.uuid(),
                    e
                ))
            })?;
        task.machine.driver_internal_info.cleaning_ports = ports;
        task.save().await?;

        if manage_boot {
            let options = build_agent_options(&self.config, self.catalog.as_ref(), &task.machine).await?;
            self.boot.prepare_ramdisk(&task.machine, &options).await?;
        }

        self.power.power_action(&task.machine, PowerAction::Reboot).await?;
        info!("Machine {} is booting into the cleaning ramdisk", task.uuid());
        Ok(ProvisionState::CleanWait)
    }

    /// 关机、清理 ramdisk 配置并退出清理网络
    pub async fn tear_down_cleaning(&self, task: &mut MachineTask, manage_boot: bool) -> Result<(), DeployError> {
        task.require_exclusive_lock("tear_down_cleaning")?;

        self.power.power_action(&task.machine, PowerAction::PowerOff).await?;
        if manage_boot {
            self.boot.clean_up_ramdisk(&task.machine).await?;
        }
        self.remove_cleaning_ports(task).await
    }

    async fn remove_cleaning_ports(&self, task: &mut MachineTask) -> Result<(), DeployError> {
        let ports = std::mem::take(&mut task.machine.driver_internal_info.cleaning_ports);
        if let Err(e) = self.network.remove_cleaning_network(&task.machine, &ports).await {
            warn!("Failed to remove cleaning ports of machine {}: {}", task.uuid(), e);
            task.machine.driver_internal_info.cleaning_ports = ports;
            return Err(DeployError::CleaningFailure(format!(
                "failed to remove cleaning ports for machine {}: {}",
                task.uuid(),
                e
            )));
        }
        task.save().await
    }
}
