/// 机器模型
/// 
/// 集群管理器持有的机器记录在这里以强类型表示，外部记录在加载时完成校验

mod lenient;
pub mod store;

use common::models::constants::VALID_DISK_LABELS;
use common::models::{BootMode, BootOption, ProvisionState};
use common::ws_rpc::CleanStep;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::deploy::DeployError;

pub use store::{MachineStore, MemoryMachineStore};

/// 物理机器
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub uuid: Uuid,
    /// 部署在该机器上的逻辑实例
    #[serde(default)]
    pub instance_uuid: Option<Uuid>,
    #[serde(default)]
    pub driver: String,
    pub provision_state: ProvisionState,
    #[serde(default)]
    pub target_provision_state: Option<ProvisionState>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub properties: MachineProperties,
    #[serde(default)]
    pub instance_info: InstanceInfo,
    #[serde(default)]
    pub driver_internal_info: DriverInternalInfo,
}

/// 机器的硬件属性
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MachineProperties {
    #[serde(default, skip_serializing_if = "Capabilities::is_unset")]
    pub capabilities: Capabilities,
    /// 根设备提示，原样保存，在校验时解析
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_device: Option<Map<String, Value>>,
}

/// 运维方请求的实例信息
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_source: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub root_gb: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub swap_mb: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub ephemeral_gb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_format: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_bool", skip_serializing_if = "Option::is_none")]
    pub preserve_ephemeral: Option<bool>,
    /// 配置盘内容（可能有几十 MB），不得写入日志
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configdrive: Option<String>,
    #[serde(default, skip_serializing_if = "Capabilities::is_unset")]
    pub capabilities: Capabilities,
    /// 部署核心不关心的字段，保存时原样写回
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 驱动内部的编排元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DriverInternalInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_whole_disk_image: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_last_heartbeat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_uuid_or_disk_id: Option<String>,
    /// 上次保留临时分区部署时的磁盘布局
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<DiskLayout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_cached_clean_steps: Option<HashMap<String, Vec<CleanStep>>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleaning_ports: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 磁盘布局快照
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskLayout {
    pub root_gb: u64,
    pub swap_mb: u64,
    pub ephemeral_gb: u64,
}

/// 能力在外部记录中的写法
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CapabilitiesForm {
    /// 记录中没有该字段
    #[default]
    Absent,
    Text,
    Map,
}

/// 能力集合
///
/// 外部记录里既可能是 `"boot_mode:uefi,boot_option:local"` 这样的字符串，也可能是对象，
/// 保存时按加载时的写法输出
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(try_from = "RawCapabilities")]
pub struct Capabilities {
    pub boot_mode: Option<String>,
    pub boot_option: Option<String>,
    pub disk_label: Option<String>,
    pub secure_boot: Option<String>,
    pub extra: BTreeMap<String, String>,
    pub form: CapabilitiesForm,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCapabilities {
    Text(String),
    Map(BTreeMap<String, String>),
}

impl TryFrom<RawCapabilities> for Capabilities {
    type Error = String;

    fn try_from(raw: RawCapabilities) -> Result<Self, Self::Error> {
        let (mut pairs, form) = match raw {
            RawCapabilities::Map(map) => (map, CapabilitiesForm::Map),
            RawCapabilities::Text(text) => {
                let mut map = BTreeMap::new();
                for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (key, value) = item
                        .split_once(':')
                        .ok_or_else(|| format!("malformed capability '{}'", item))?;
                    map.insert(key.trim().to_string(), value.trim().to_string());
                }
                (map, CapabilitiesForm::Text)
            }
        };

        Ok(Self {
            boot_mode: pairs.remove("boot_mode"),
            boot_option: pairs.remove("boot_option"),
            disk_label: pairs.remove("disk_label"),
            secure_boot: pairs.remove("secure_boot"),
            extra: pairs,
            form,
        })
    }
}

impl Capabilities {
    fn pairs(&self) -> BTreeMap<&str, &str> {
        let named = [
            ("boot_mode", &self.boot_mode),
            ("boot_option", &self.boot_option),
            ("disk_label", &self.disk_label),
            ("secure_boot", &self.secure_boot),
        ];
        named
            .into_iter()
            .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .collect()
    }

    /// 记录中没有能力字段，代码也没有设置任何能力
    pub fn is_unset(&self) -> bool {
        self.form == CapabilitiesForm::Absent && self.pairs().is_empty()
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs = self.pairs();
        match self.form {
            CapabilitiesForm::Text => {
                let text = pairs
                    .iter()
                    .map(|(key, value)| format!("{}:{}", key, value))
                    .collect::<Vec<_>>()
                    .join(",");
                serializer.serialize_str(&text)
            }
            CapabilitiesForm::Map | CapabilitiesForm::Absent => pairs.serialize(serializer),
        }
    }
}

impl Machine {
    pub fn new(uuid: Uuid, provision_state: ProvisionState) -> Self {
        Self {
            uuid,
            instance_uuid: None,
            driver: String::new(),
            provision_state,
            target_provision_state: None,
            last_error: None,
            properties: MachineProperties::default(),
            instance_info: InstanceInfo::default(),
            driver_internal_info: DriverInternalInfo::default(),
        }
    }

    /// 未记录时按分区镜像处理
    pub fn is_whole_disk_image(&self) -> bool {
        self.driver_internal_info.is_whole_disk_image.unwrap_or(false)
    }

    /// 实例能力优先，其次是机器能力
    fn capability<'a>(&'a self, pick: impl Fn(&'a Capabilities) -> Option<&'a String>) -> Option<&'a str> {
        pick(&self.instance_info.capabilities)
            .or_else(|| pick(&self.properties.capabilities))
            .map(String::as_str)
    }

    /// 部署使用的启动方式，未指定时为网络引导
    pub fn boot_option(&self) -> Result<BootOption, DeployError> {
        match self.capability(|c| c.boot_option.as_ref()) {
            Some(value) => value.parse::<BootOption>().map_err(DeployError::InvalidParameter),
            None => Ok(BootOption::default()),
        }
    }

    /// 部署使用的启动模式，无法确定时返回 `None`
    ///
    /// 开启安全启动的机器必须以 UEFI 模式部署
    pub fn boot_mode_for_deploy(&self) -> Result<Option<BootMode>, DeployError> {
        if self
            .capability(|c| c.secure_boot.as_ref())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Ok(Some(BootMode::Uefi));
        }
        self.capability(|c| c.boot_mode.as_ref())
            .map(|value| value.parse::<BootMode>().map_err(DeployError::InvalidParameter))
            .transpose()
    }

    /// 显式配置的分区表类型
    pub fn disk_label(&self) -> Result<Option<String>, DeployError> {
        match self.capability(|c| c.disk_label.as_ref()) {
            Some(label) if VALID_DISK_LABELS.contains(&label) => Ok(Some(label.to_string())),
            Some(label) => Err(DeployError::InvalidParameter(format!(
                "invalid disk_label '{}', expected one of: {}",
                label,
                VALID_DISK_LABELS.join(", ")
            ))),
            None => Ok(None),
        }
    }
}

/// 校验启动相关能力的取值
pub fn validate_capabilities(machine: &Machine) -> Result<(), DeployError> {
    for caps in [&machine.properties.capabilities, &machine.instance_info.capabilities] {
        if let Some(mode) = &caps.boot_mode {
            mode.parse::<BootMode>().map_err(DeployError::InvalidParameter)?;
        }
        if let Some(option) = &caps.boot_option {
            option.parse::<BootOption>().map_err(DeployError::InvalidParameter)?;
        }
    }
    machine.disk_label()?;
    Ok(())
}

/// 根设备提示
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootDeviceHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wwn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wwn_with_extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wwn_vendor_extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

const VALID_ROOT_DEVICE_HINTS: &[&str] = &[
    "size",
    "model",
    "wwn",
    "serial",
    "vendor",
    "wwn_with_extension",
    "wwn_vendor_extension",
    "name",
];

/// 解析并校验机器的根设备提示
pub fn parse_root_device_hints(machine: &Machine) -> Result<Option<RootDeviceHints>, DeployError> {
    let Some(raw) = &machine.properties.root_device else {
        return Ok(None);
    };

    let mut invalid: Vec<&str> = raw
        .keys()
        .map(String::as_str)
        .filter(|key| !VALID_ROOT_DEVICE_HINTS.contains(key))
        .collect();
    if !invalid.is_empty() {
        invalid.sort_unstable();
        return Err(DeployError::InvalidParameter(format!(
            "root device hints contain unsupported keys: {}. Supported hints are: {}",
            invalid.join(", "),
            VALID_ROOT_DEVICE_HINTS.join(", ")
        )));
    }

    let size = match raw.get("size") {
        None => None,
        Some(value) => {
            let size = lenient::u64_from_value(value).filter(|size| *size > 0).ok_or_else(|| {
                DeployError::InvalidParameter(format!(
                    "root device hint 'size' must be a positive integer, got {}",
                    value
                ))
            })?;
            Some(size)
        }
    };

    let text = |key: &str| -> Result<Option<String>, DeployError> {
        match raw.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(DeployError::InvalidParameter(format!(
                "root device hint '{}' must be a string, got {}",
                key, other
            ))),
        }
    };

    let hints = RootDeviceHints {
        size,
        model: text("model")?,
        vendor: text("vendor")?,
        serial: text("serial")?,
        wwn: text("wwn")?,
        wwn_with_extension: text("wwn_with_extension")?,
        wwn_vendor_extension: text("wwn_vendor_extension")?,
        name: text("name")?,
    };

    if let Some(name) = &hints.name {
        if !name.starts_with("/dev/") {
            return Err(DeployError::InvalidParameter(format!(
                "root device hint 'name' must be a device path under /dev/, got '{}'",
                name
            )));
        }
    }

    Ok(Some(hints))
}
