/// 磁盘布局记录
/// 
/// 要求保留临时分区时，把本次部署的磁盘布局写入 `driver_internal_info.instance`，
/// 之后重新部署时据此检查布局没有变化

use tracing::info;

use super::error::DeployError;
use crate::lock::MachineTask;
use crate::machine::{DiskLayout, Machine};

/// 上次记录的布局
pub fn recorded_disk_layout(machine: &Machine) -> Option<DiskLayout> {
    machine.driver_internal_info.instance
}

/// 写入布局并持久化
pub async fn save_disk_layout(task: &mut MachineTask, layout: DiskLayout) -> Result<(), DeployError> {
    task.require_exclusive_lock("save_disk_layout")?;
    task.machine.driver_internal_info.instance = Some(layout);
    task.save().await?;
    info!(
        "Saved disk layout for machine {}: root_gb={}, swap_mb={}, ephemeral_gb={}",
        task.uuid(),
        layout.root_gb,
        layout.swap_mb,
        layout.ephemeral_gb
    );
    Ok(())
}

/// 请求的布局与已记录的布局不一致时返回参数错误
pub fn check_disk_layout_unchanged(machine: &Machine, requested: &DiskLayout) -> Result<(), DeployError> {
    let Some(recorded) = recorded_disk_layout(machine) else {
        return Ok(());
    };

    let mut changed = Vec::new();
    for (name, old, new) in [
        ("root_gb", recorded.root_gb, requested.root_gb),
        ("swap_mb", recorded.swap_mb, requested.swap_mb),
        ("ephemeral_gb", recorded.ephemeral_gb, requested.ephemeral_gb),
    ] {
        if old != new {
            changed.push(format!("{} from {} to {}", name, old, new));
        }
    }

    if changed.is_empty() {
        Ok(())
    } else {
        Err(DeployError::InvalidParameter(format!(
            "The following parameters have different values from previous deployment of machine {}: {}",
            machine.uuid,
            changed.join(", ")
        )))
    }
}
