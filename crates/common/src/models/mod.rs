/// 共享数据模型
/// 
/// 定义 Conductor 和部署 Agent 共享的状态与枚举

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 机器的部署状态
///
/// 只包含本部署核心会读取或驱动的状态，其余状态由外部的集群管理器维护
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionState {
    Available,
    Deploying,
    #[serde(rename = "wait call-back")]
    DeployWait,
    #[serde(rename = "deploy failed")]
    DeployFailed,
    Active,
    Deleting,
    Deleted,
    Cleaning,
    #[serde(rename = "clean wait")]
    CleanWait,
    #[serde(rename = "clean failed")]
    CleanFailed,
    Error,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Available => "available",
            ProvisionState::Deploying => "deploying",
            ProvisionState::DeployWait => "wait call-back",
            ProvisionState::DeployFailed => "deploy failed",
            ProvisionState::Active => "active",
            ProvisionState::Deleting => "deleting",
            ProvisionState::Deleted => "deleted",
            ProvisionState::Cleaning => "cleaning",
            ProvisionState::CleanWait => "clean wait",
            ProvisionState::CleanFailed => "clean failed",
            ProvisionState::Error => "error",
        }
    }

    /// 根据事件计算下一个状态，不允许的事件返回 `None`
    pub fn next(self, event: ProvisionEvent) -> Option<ProvisionState> {
        use ProvisionEvent as E;
        use ProvisionState as S;

        match (self, event) {
            (S::Available | S::DeployFailed | S::Active, E::Deploy) => Some(S::Deploying),
            (S::Deploying, E::Wait) => Some(S::DeployWait),
            (S::DeployWait, E::Resume) => Some(S::Deploying),
            (S::Deploying, E::Done) => Some(S::Active),
            (S::Deploying | S::DeployWait, E::Fail) => Some(S::DeployFailed),

            (S::Active | S::DeployFailed | S::DeployWait | S::Error, E::Delete) => Some(S::Deleting),
            (S::Deleting, E::Done) => Some(S::Deleted),
            (S::Deleting, E::Fail) => Some(S::Error),

            (S::Deleted, E::Clean) => Some(S::Cleaning),
            (S::Cleaning, E::Wait) => Some(S::CleanWait),
            (S::CleanWait, E::Resume) => Some(S::Cleaning),
            (S::Cleaning, E::Done) => Some(S::Available),
            (S::Cleaning | S::CleanWait, E::Fail) => Some(S::CleanFailed),
            _ => None,
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "available" => ProvisionState::Available,
            "deploying" => ProvisionState::Deploying,
            "wait call-back" => ProvisionState::DeployWait,
            "deploy failed" => ProvisionState::DeployFailed,
            "active" => ProvisionState::Active,
            "deleting" => ProvisionState::Deleting,
            "deleted" => ProvisionState::Deleted,
            "cleaning" => ProvisionState::Cleaning,
            "clean wait" => ProvisionState::CleanWait,
            "clean failed" => ProvisionState::CleanFailed,
            "error" => ProvisionState::Error,
            other => return Err(format!("unknown provision state: {}", other)),
        };
        Ok(state)
    }
}

/// 部署状态机事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionEvent {
    Deploy,
    Wait,
    Resume,
    Done,
    Fail,
    Delete,
    Clean,
}

/// 电源操作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
    Reboot,
}

/// 启动模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    #[default]
    Bios,
    Uefi,
}

impl BootMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootMode::Bios => "bios",
            BootMode::Uefi => "uefi",
        }
    }
}

impl FromStr for BootMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bios" => Ok(BootMode::Bios),
            "uefi" => Ok(BootMode::Uefi),
            other => Err(format!("invalid boot_mode '{}', expected one of: bios, uefi", other)),
        }
    }
}

/// 实例的启动方式：本地磁盘引导或网络引导
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BootOption {
    Local,
    #[default]
    Netboot,
}

impl BootOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootOption::Local => "local",
            BootOption::Netboot => "netboot",
        }
    }
}

impl FromStr for BootOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BootOption::Local),
            "netboot" => Ok(BootOption::Netboot),
            other => Err(format!("invalid boot_option '{}', expected one of: local, netboot", other)),
        }
    }
}

/// 常量定义
pub mod constants {
    /// 默认 iSCSI portal 端口
    pub const DEFAULT_PORTAL_PORT: u16 = 3260;

    /// 默认 LUN
    pub const DEFAULT_LUN: &str = "1";

    /// iSCSI target 名称前缀，Agent 与 target 暴露调用两端必须逐字节一致
    pub const IQN_PREFIX: &str = "iqn.2008-10.org.openstack";

    /// 未能确定启动模式时的回退值
    pub const DEFAULT_BOOT_MODE: &str = "bios";

    /// 允许的磁盘分区表类型
    pub const VALID_DISK_LABELS: &[&str] = &["msdos", "gpt"];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_happy_path() {
        let state = ProvisionState::Available;
        let state = state.next(ProvisionEvent::Deploy).unwrap();
        assert_eq!(state, ProvisionState::Deploying);
        let state = state.next(ProvisionEvent::Wait).unwrap();
        assert_eq!(state, ProvisionState::DeployWait);
        let state = state.next(ProvisionEvent::Resume).unwrap();
        let state = state.next(ProvisionEvent::Done).unwrap();
        assert_eq!(state, ProvisionState::Active);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(ProvisionState::Available.next(ProvisionEvent::Resume).is_none());
        assert!(ProvisionState::Active.next(ProvisionEvent::Wait).is_none());
        assert_eq!(
            ProvisionState::DeployWait.next(ProvisionEvent::Fail),
            Some(ProvisionState::DeployFailed)
        );
    }

    #[test]
    fn test_state_string_form() {
        for state in [
            ProvisionState::DeployWait,
            ProvisionState::CleanWait,
            ProvisionState::DeployFailed,
            ProvisionState::Active,
        ] {
            assert_eq!(state.as_str().parse::<ProvisionState>().unwrap(), state);
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.as_str().to_string())
            );
        }
    }

    #[test]
    fn test_boot_values() {
        assert_eq!("uefi".parse::<BootMode>().unwrap(), BootMode::Uefi);
        assert!("efi".parse::<BootMode>().is_err());
        assert_eq!("local".parse::<BootOption>().unwrap(), BootOption::Local);
        assert!("pxe".parse::<BootOption>().is_err());
    }
}
