/// 工具函数集合

use crate::models::constants::IQN_PREFIX;
use uuid::Uuid;

/// 生成机器的 iSCSI target 名称
///
/// 只依赖机器 UUID，同一台机器始终得到相同的 IQN
pub fn iscsi_iqn(machine_uuid: &Uuid) -> String {
    format!("{}:{}", IQN_PREFIX, machine_uuid)
}

/// 从 Agent 回调 URL 中提取主机地址
pub fn agent_host_from_url(agent_url: &str) -> Option<String> {
    let parsed = url::Url::parse(agent_url).ok()?;
    match parsed.host()? {
        url::Host::Domain(domain) => Some(domain.to_string()),
        url::Host::Ipv4(addr) => Some(addr.to_string()),
        url::Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
