/// 应用全局状态

use std::sync::Arc;

use crate::collaborators::{AgentClient, BootInterface, ImageInspector, NetworkProvider, PowerController, ServiceCatalog};
use crate::config::DeployConfig;
use crate::deploy::{
    AgentDeployVendor, AsyncContinuationHandler, DeploymentOrchestrator, DiskWriter,
    FailureRollbackPolicy, ImageWriters, InbandCleaning,
};
use crate::heartbeat::HeartbeatDispatcher;
use crate::images::{CacheMaintenanceCoordinator, ImageArtifacts, InstanceImageStore};
use crate::lock::MachineLocks;
use crate::machine::MachineStore;
use crate::ws::{AgentConnectionManager, WsAgentClient};

/// 外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub power: Arc<dyn PowerController>,
    pub boot: Arc<dyn BootInterface>,
    pub network: Arc<dyn NetworkProvider>,
    pub catalog: Arc<dyn ServiceCatalog>,
    pub inspector: Arc<dyn ImageInspector>,
    pub image_store: Arc<dyn InstanceImageStore>,
    pub whole_disk_writer: Arc<dyn DiskWriter>,
    pub partition_writer: Arc<dyn DiskWriter>,
}

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DeployConfig>,
    pub store: Arc<dyn MachineStore>,
    pub locks: MachineLocks,
    /// 部署代理 WebSocket 连接管理器
    pub agent_manager: AgentConnectionManager,
    pub artifacts: Arc<ImageArtifacts>,
    pub rollback: Arc<FailureRollbackPolicy>,
    pub continuation: Arc<AsyncContinuationHandler>,
    pub vendor: Arc<AgentDeployVendor>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub dispatcher: HeartbeatDispatcher,
}

impl AppState {
    /// 使用 WebSocket 代理客户端组装
    pub fn new(config: DeployConfig, store: Arc<dyn MachineStore>, collaborators: Collaborators) -> Self {
        let agent_manager = AgentConnectionManager::new();
        let agent = Arc::new(WsAgentClient::new(agent_manager.clone(), config.agent_command_timeout()));
        Self::from_parts(config, store, collaborators, agent_manager, agent)
    }

    pub fn from_parts(
        config: DeployConfig,
        store: Arc<dyn MachineStore>,
        collaborators: Collaborators,
        agent_manager: AgentConnectionManager,
        agent: Arc<dyn AgentClient>,
    ) -> Self {
        let config = Arc::new(config);

        let mut maintenance = CacheMaintenanceCoordinator::new();
        maintenance.register_instance_cache(collaborators.image_store.clone());

        let artifacts = Arc::new(ImageArtifacts::new(
            config.clone(),
            collaborators.image_store.clone(),
            Arc::new(maintenance),
            collaborators.inspector.clone(),
        ));
        let rollback = Arc::new(FailureRollbackPolicy::new(
            config.clone(),
            collaborators.power.clone(),
            artifacts.clone(),
        ));
        let continuation = Arc::new(AsyncContinuationHandler::new(
            config.clone(),
            ImageWriters::new(collaborators.whole_disk_writer.clone(), collaborators.partition_writer.clone()),
            rollback.clone(),
            artifacts.clone(),
        ));
        let vendor = Arc::new(AgentDeployVendor::new(
            continuation.clone(),
            rollback.clone(),
            agent.clone(),
            collaborators.boot.clone(),
            collaborators.power.clone(),
        ));
        let cleaning = InbandCleaning::new(
            config.clone(),
            agent,
            collaborators.boot.clone(),
            collaborators.power.clone(),
            collaborators.network.clone(),
            collaborators.catalog.clone(),
        );
        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            config.clone(),
            collaborators.boot,
            collaborators.power,
            collaborators.network,
            collaborators.catalog,
            artifacts.clone(),
            cleaning,
        ));

        let locks = MachineLocks::new();
        let dispatcher = HeartbeatDispatcher::new(locks.clone(), store.clone(), vendor.clone());

        Self {
            config,
            store,
            locks,
            agent_manager,
            artifacts,
            rollback,
            continuation,
            vendor,
            orchestrator,
            dispatcher,
        }
    }
}
