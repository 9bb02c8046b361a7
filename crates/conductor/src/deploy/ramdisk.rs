/// 部署 ramdisk 的启动参数

use tracing::debug;

use super::error::DeployError;
use crate::collaborators::{RamdiskOptions, ServiceCatalog};
use crate::config::DeployConfig;
use crate::machine::{parse_root_device_hints, Machine, RootDeviceHints};

/// 服务目录中控制面 API 的服务类型
pub const CONTROL_PLANE_SERVICE_TYPE: &str = "baremetal";

/// 控制面 API 地址：优先使用配置，其次查询服务目录
pub async fn resolve_api_url(
    config: &DeployConfig,
    catalog: &dyn ServiceCatalog,
) -> Result<String, DeployError> {
    if let Some(url) = &config.api_url {
        return Ok(url.clone());
    }

    catalog
        .service_url(CONTROL_PLANE_SERVICE_TYPE)
        .await
        .map_err(|e| {
            DeployError::InvalidParameter(format!(
                "Couldn't get the URL of the control plane API from the configuration or the service catalog. Catalog error: {}",
                e
            ))
        })
}

/// 把根设备提示编码成 `key=value,key=value`
fn root_device_param(hints: &RootDeviceHints) -> Result<String, DeployError> {
    let value = serde_json::to_value(hints).map_err(common::Error::from)?;
    let pairs: Vec<String> = value
        .as_object()
        .into_iter()
        .flatten()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect();
    Ok(pairs.join(","))
}

pub async fn build_agent_options(
    config: &DeployConfig,
    catalog: &dyn ServiceCatalog,
    machine: &Machine,
) -> Result<RamdiskOptions, DeployError> {
    let mut options = RamdiskOptions::new();
    options.insert("ipa-api-url".to_string(), resolve_api_url(config, catalog).await?);
    options.insert("ipa-driver-name".to_string(), machine.driver.clone());

    if let Some(hints) = parse_root_device_hints(machine)? {
        let param = root_device_param(&hints)?;
        if !param.is_empty() {
            options.insert("root_device".to_string(), param);
        }
    }

    debug!("Agent ramdisk options for machine {}: {:?}", machine.uuid, options);
    Ok(options)
}
