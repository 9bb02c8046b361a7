/// Agent RPC 数据类型定义
/// 
/// 部署 Agent 与 Conductor 之间交换的请求、通知与命令结果

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// RPC 方法名
pub mod methods {
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const CLEAN_STEPS: &str = "clean_steps";
    pub const START_ISCSI_TARGET: &str = "start_iscsi_target";
    pub const INSTALL_BOOTLOADER: &str = "install_bootloader";
    pub const EXECUTE_CLEAN_STEP: &str = "execute_clean_step";
}

// ============================================================================
// 注册与心跳
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub machine_id: Uuid,
    /// Agent 的回调地址，例如 `http://10.0.0.5:9999`
    pub agent_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatNotification {
    pub machine_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Agent 上报的清理步骤目录，按接口名分组
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanStepsNotification {
    pub machine_id: Uuid,
    pub clean_steps: HashMap<String, Vec<CleanStep>>,
}

// ============================================================================
// 命令
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartIscsiTargetRequest {
    pub iqn: String,
    pub portal_port: u16,
    /// 暴露磁盘前是否清除已有的分区表/文件系统签名
    pub wipe_disk_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallBootloaderRequest {
    pub root_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi_system_part_uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteCleanStepRequest {
    pub step: CleanStep,
}

/// Agent 命令状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Running,
    Succeeded,
    Failed,
}

/// Agent 命令的执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    #[serde(default)]
    pub command_name: String,
    pub command_status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_result: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn is_failed(&self) -> bool {
        self.command_status == CommandStatus::Failed
    }

    /// 错误描述，字符串错误原样返回，其他 JSON 值序列化后返回
    pub fn error_text(&self) -> String {
        match &self.command_error {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }
    }
}

// ============================================================================
// 清理步骤
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanStep {
    pub step: String,
    pub interface: String,
    pub priority: i32,
    #[serde(default)]
    pub abortable: bool,
    #[serde(default)]
    pub reboot_requested: bool,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}
