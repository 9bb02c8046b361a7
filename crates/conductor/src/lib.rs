//! 裸金属 iSCSI 部署核心
//!
//! 集群管理器通过 `DeploymentOrchestrator` 驱动部署，部署代理通过 WebSocket 心跳触发续部署

pub mod app_state;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod deploy;
pub mod heartbeat;
pub mod images;
pub mod lock;
pub mod logging;
pub mod machine;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use app_state::{AppState, Collaborators};
pub use config::DeployConfig;
pub use deploy::{DeployError, DeployResult};
