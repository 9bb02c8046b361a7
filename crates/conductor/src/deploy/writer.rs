/// 镜像写入
/// 
/// 整盘镜像与分区镜像由不同的写入器处理，按机器的整盘标记选择

use async_trait::async_trait;
use common::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::params::DeployParameters;
use crate::machine::Machine;

pub const ROOT_UUID_KEY: &str = "root uuid";
pub const EFI_SYSTEM_PARTITION_UUID_KEY: &str = "efi system partition uuid";
pub const DISK_IDENTIFIER_KEY: &str = "disk identifier";

/// 写入结果
///
/// `efi_system_partition_uuid` 为 `Some(None)` 表示结果中带有该键但分区不存在，
/// 为 `None` 表示结果中没有该键
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployResult {
    Partition {
        root_uuid: Option<String>,
        efi_system_partition_uuid: Option<Option<String>>,
    },
    WholeDisk {
        disk_identifier: Option<String>,
    },
}

impl DeployResult {
    /// 根分区 UUID 或磁盘标识，空字符串视为缺失
    pub fn root_uuid_or_disk_id(&self) -> Option<&str> {
        let id = match self {
            Self::Partition { root_uuid, .. } => root_uuid.as_deref(),
            Self::WholeDisk { disk_identifier } => disk_identifier.as_deref(),
        };
        id.filter(|id| !id.is_empty())
    }

    pub fn root_uuid(&self) -> Option<&str> {
        match self {
            Self::Partition { root_uuid, .. } => root_uuid.as_deref(),
            Self::WholeDisk { .. } => None,
        }
    }

    pub fn efi_system_partition_uuid(&self) -> Option<&str> {
        match self {
            Self::Partition {
                efi_system_partition_uuid: Some(uuid),
                ..
            } => uuid.as_deref(),
            _ => None,
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::Partition {
                root_uuid,
                efi_system_partition_uuid,
            } => {
                map.insert(ROOT_UUID_KEY.to_string(), root_uuid.clone().into());
                if let Some(efi) = efi_system_partition_uuid {
                    map.insert(EFI_SYSTEM_PARTITION_UUID_KEY.to_string(), efi.clone().into());
                }
            }
            Self::WholeDisk { disk_identifier } => {
                map.insert(DISK_IDENTIFIER_KEY.to_string(), disk_identifier.clone().into());
            }
        }
        map
    }

    /// 从写入器返回的映射解析，两类键必须恰好出现一类
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let text = |key: &str| -> Result<Option<String>> {
            match map.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(Error::InvalidArgument(format!(
                    "'{}' must be a string, got {}",
                    key, other
                ))),
            }
        };

        match (map.contains_key(ROOT_UUID_KEY), map.contains_key(DISK_IDENTIFIER_KEY)) {
            (true, false) => Ok(Self::Partition {
                root_uuid: text(ROOT_UUID_KEY)?,
                efi_system_partition_uuid: if map.contains_key(EFI_SYSTEM_PARTITION_UUID_KEY) {
                    Some(text(EFI_SYSTEM_PARTITION_UUID_KEY)?)
                } else {
                    None
                },
            }),
            (false, true) => Ok(Self::WholeDisk {
                disk_identifier: text(DISK_IDENTIFIER_KEY)?,
            }),
            _ => Err(Error::InvalidArgument(format!(
                "deploy result must contain exactly one of '{}' or '{}'",
                ROOT_UUID_KEY, DISK_IDENTIFIER_KEY
            ))),
        }
    }
}

impl Serialize for DeployResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DeployResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = Map::deserialize(deserializer)?;
        Self::from_map(&map).map_err(serde::de::Error::custom)
    }
}

/// 镜像类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    WholeDisk,
    Partition,
}

impl ImageKind {
    pub fn of(machine: &Machine) -> Self {
        if machine.is_whole_disk_image() {
            Self::WholeDisk
        } else {
            Self::Partition
        }
    }
}

/// 通过暴露出的 iSCSI 设备写入镜像
#[async_trait]
pub trait DiskWriter: Send + Sync {
    async fn write(&self, params: &DeployParameters) -> Result<DeployResult>;
}

/// 两种写入器
#[derive(Clone)]
pub struct ImageWriters {
    whole_disk: Arc<dyn DiskWriter>,
    partition: Arc<dyn DiskWriter>,
}

impl ImageWriters {
    pub fn new(whole_disk: Arc<dyn DiskWriter>, partition: Arc<dyn DiskWriter>) -> Self {
        Self { whole_disk, partition }
    }

    pub async fn write(&self, kind: ImageKind, params: &DeployParameters) -> Result<DeployResult> {
        match kind {
            ImageKind::WholeDisk => self.whole_disk.write(params).await,
            ImageKind::Partition => self.partition.write(params).await,
        }
    }
}
