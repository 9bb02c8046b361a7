/// 外部协作方接口
/// 
/// 电源、引导、网络、服务目录与部署代理都由部署核心以外的组件实现

use async_trait::async_trait;
use common::models::PowerAction;
use common::ws_rpc::{CleanStep, CommandResult, InstallBootloaderRequest, StartIscsiTargetRequest};
use common::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::deploy::DeployError;
use crate::machine::Machine;

/// 传给部署 ramdisk 的内核参数
pub type RamdiskOptions = BTreeMap<String, String>;

/// 电源控制
#[async_trait]
pub trait PowerController: Send + Sync {
    async fn power_action(&self, machine: &Machine, action: PowerAction) -> Result<()>;
}

/// 引导接口
#[async_trait]
pub trait BootInterface: Send + Sync {
    /// 校验引导所需的机器信息，失败时返回参数类错误
    async fn validate(&self, machine: &Machine) -> std::result::Result<(), DeployError>;

    async fn prepare_ramdisk(&self, machine: &Machine, options: &RamdiskOptions) -> Result<()>;

    async fn prepare_instance(&self, machine: &Machine) -> Result<()>;

    async fn clean_up_ramdisk(&self, machine: &Machine) -> Result<()>;

    async fn clean_up_instance(&self, machine: &Machine) -> Result<()>;
}

/// 网络提供方
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    async fn clean_dhcp(&self, machine: &Machine) -> Result<()>;

    /// 把机器接入清理网络，返回创建的端口
    async fn add_cleaning_network(&self, machine: &Machine) -> Result<Vec<String>>;

    async fn remove_cleaning_network(&self, machine: &Machine, ports: &[String]) -> Result<()>;
}

/// 服务目录，用于查找部署代理回调的 API 地址
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn service_url(&self, service_type: &str) -> Result<String>;
}

/// 运行在 ramdisk 中的部署代理
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn start_iscsi_target(
        &self,
        machine: &Machine,
        request: &StartIscsiTargetRequest,
    ) -> Result<CommandResult>;

    async fn install_bootloader(
        &self,
        machine: &Machine,
        request: &InstallBootloaderRequest,
    ) -> Result<CommandResult>;

    async fn execute_clean_step(&self, machine: &Machine, step: &CleanStep) -> Result<CommandResult>;
}

/// 镜像检查，返回镜像的虚拟大小（MB）
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn virtual_size_mb(&self, path: &Path) -> Result<u64>;
}

/// 基于 `qemu-img info` 的镜像检查
#[derive(Debug, Clone, Default)]
pub struct QemuImgInspector;

#[async_trait]
impl ImageInspector for QemuImgInspector {
    async fn virtual_size_mb(&self, path: &Path) -> Result<u64> {
        debug!("Inspecting image {}", path.display());

        let output = Command::new("qemu-img")
            .arg("info")
            .arg("--output=json")
            .arg(path)
            .output()
            .await
            .map_err(|e| Error::Storage(format!("Failed to run qemu-img info: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Storage(format!("qemu-img info failed: {}", stderr)));
        }

        virtual_size_mb_from_info(&output.stdout)
    }
}

const MIB: u64 = 1024 * 1024;

/// 从 `qemu-img info` 的 JSON 输出解析虚拟大小，不足 1 MB 的部分向上取整
fn virtual_size_mb_from_info(stdout: &[u8]) -> Result<u64> {
    let info: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| Error::Storage(format!("Failed to parse qemu-img output: {}", e)))?;

    let virtual_size = info["virtual-size"]
        .as_u64()
        .ok_or_else(|| Error::Storage("virtual-size not found in qemu-img output".to_string()))?;

    Ok(virtual_size.div_ceil(MIB))
}
