/// 部署参数的推导与校验

use common::models::constants::DEFAULT_LUN;
use common::models::{BootMode, BootOption};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::error::DeployError;
use super::ledger;
use crate::config::DeployConfig;
use crate::images::image_file_path;
use crate::machine::{DiskLayout, Machine};

/// 解析后的实例信息
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInstanceInfo {
    pub image_source: String,
    /// 整盘镜像可以不指定
    pub root_gb: Option<u64>,
    pub swap_mb: u64,
    pub ephemeral_gb: u64,
    pub ephemeral_format: Option<String>,
    pub preserve_ephemeral: bool,
}

impl ParsedInstanceInfo {
    pub fn disk_layout(&self) -> Option<DiskLayout> {
        self.root_gb.map(|root_gb| DiskLayout {
            root_gb,
            swap_mb: self.swap_mb,
            ephemeral_gb: self.ephemeral_gb,
        })
    }
}

/// 解析并校验机器的实例信息
///
/// 要求保留临时分区时还会检查磁盘布局与上次部署一致
pub fn parse_instance_info(machine: &Machine, config: &DeployConfig) -> Result<ParsedInstanceInfo, DeployError> {
    let info = &machine.instance_info;
    let whole_disk = machine.is_whole_disk_image();

    let mut missing = Vec::new();
    let image_source = required(&mut missing, "image_source", info.image_source.clone());
    let root_gb = if whole_disk {
        info.root_gb
    } else {
        required(&mut missing, "root_gb", info.root_gb)
    };
    let Some(image_source) = image_source else {
        return Err(DeployError::MissingParameter(missing));
    };
    if !missing.is_empty() {
        return Err(DeployError::MissingParameter(missing));
    }

    let ephemeral_gb = info.ephemeral_gb.unwrap_or(0);
    let ephemeral_format = match info.ephemeral_format.clone() {
        Some(format) => Some(format),
        None if ephemeral_gb > 0 => Some(config.default_ephemeral_format.clone()),
        None => None,
    };

    let parsed = ParsedInstanceInfo {
        image_source,
        root_gb,
        swap_mb: info.swap_mb.unwrap_or(0),
        ephemeral_gb,
        ephemeral_format,
        preserve_ephemeral: info.preserve_ephemeral.unwrap_or(false),
    };

    if parsed.preserve_ephemeral {
        if let Some(layout) = parsed.disk_layout() {
            ledger::check_disk_layout_unchanged(machine, &layout)?;
        }
    }

    Ok(parsed)
}

fn required<T>(missing: &mut Vec<String>, name: &str, value: Option<T>) -> Option<T> {
    if value.is_none() {
        missing.push(name.to_string());
    }
    value
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// 单次部署尝试的目标信息，来自代理的心跳
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeployTarget {
    pub address: Option<String>,
    pub iqn: Option<String>,
    pub port: Option<u16>,
    pub lun: Option<String>,
}

impl DeployTarget {
    pub fn new(address: Option<String>, iqn: impl Into<String>) -> Self {
        Self {
            address,
            iqn: Some(iqn.into()),
            port: None,
            lun: None,
        }
    }
}

/// 一次部署尝试所需的全部参数
#[derive(Debug, Clone, PartialEq)]
pub struct DeployParameters {
    pub address: String,
    pub port: u16,
    pub iqn: String,
    pub lun: String,
    pub image_path: PathBuf,
    pub machine_uuid: Uuid,
    /// 仅分区镜像有
    pub partition: Option<PartitionParameters>,
}

impl DeployParameters {
    pub fn preserve_ephemeral(&self) -> bool {
        self.partition.as_ref().is_some_and(|p| p.preserve_ephemeral)
    }
}

/// 分区镜像专有的参数
#[derive(Clone, PartialEq)]
pub struct PartitionParameters {
    pub root_mb: u64,
    pub swap_mb: u64,
    pub ephemeral_mb: u64,
    pub preserve_ephemeral: bool,
    pub boot_option: BootOption,
    pub boot_mode: BootMode,
    pub disk_label: Option<String>,
    pub ephemeral_format: Option<String>,
    pub configdrive: Option<String>,
}

impl fmt::Debug for PartitionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionParameters")
            .field("root_mb", &self.root_mb)
            .field("swap_mb", &self.swap_mb)
            .field("ephemeral_mb", &self.ephemeral_mb)
            .field("preserve_ephemeral", &self.preserve_ephemeral)
            .field("boot_option", &self.boot_option)
            .field("boot_mode", &self.boot_mode)
            .field("disk_label", &self.disk_label)
            .field("ephemeral_format", &self.ephemeral_format)
            // 配置盘可能有几十 MB
            .field("configdrive", &self.configdrive.as_ref().map(|_| "***"))
            .finish()
    }
}

/// 部署参数构造器
///
/// 纯计算，不做任何 I/O；所有缺失字段一次性报告
#[derive(Clone)]
pub struct DeployParamBuilder {
    config: Arc<DeployConfig>,
}

impl DeployParamBuilder {
    pub fn new(config: Arc<DeployConfig>) -> Self {
        Self { config }
    }

    pub fn build(&self, machine: &Machine, target: &DeployTarget) -> Result<DeployParameters, DeployError> {
        let info = &machine.instance_info;
        let whole_disk = machine.is_whole_disk_image();

        let mut missing = Vec::new();
        let address = required(&mut missing, "address", non_empty(target.address.as_deref()));
        let iqn = required(&mut missing, "iqn", non_empty(target.iqn.as_deref()));
        let image_source = required(&mut missing, "image_source", non_empty(info.image_source.as_deref()));
        let root_gb = if whole_disk {
            None
        } else {
            required(&mut missing, "root_gb", info.root_gb)
        };

        let (Some(address), Some(iqn), Some(_)) = (address, iqn, image_source) else {
            return Err(DeployError::MissingParameter(missing));
        };

        let mut params = DeployParameters {
            address,
            port: target.port.unwrap_or(self.config.portal_port),
            iqn,
            lun: target.lun.clone().unwrap_or_else(|| DEFAULT_LUN.to_string()),
            image_path: image_file_path(&self.config, &machine.uuid),
            machine_uuid: machine.uuid,
            partition: None,
        };

        if whole_disk {
            return Ok(params);
        }

        let Some(root_gb) = root_gb else {
            return Err(DeployError::MissingParameter(missing));
        };
        let parsed = parse_instance_info(machine, &self.config)?;

        params.partition = Some(PartitionParameters {
            root_mb: root_gb * 1024,
            swap_mb: parsed.swap_mb,
            ephemeral_mb: parsed.ephemeral_gb * 1024,
            preserve_ephemeral: parsed.preserve_ephemeral,
            boot_option: machine.boot_option()?,
            boot_mode: machine.boot_mode_for_deploy()?.unwrap_or_default(),
            disk_label: machine.disk_label()?,
            ephemeral_format: parsed.ephemeral_format,
            configdrive: info.configdrive.clone(),
        });

        Ok(params)
    }
}
