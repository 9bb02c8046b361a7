//! 单元测试共用的假协作方与组装

use async_trait::async_trait;
use common::models::{PowerAction, ProvisionState};
use common::ws_rpc::{
    CleanStep, CommandResult, CommandStatus, InstallBootloaderRequest, StartIscsiTargetRequest,
};
use common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

use crate::app_state::{AppState, Collaborators};
use crate::collaborators::{
    AgentClient, BootInterface, ImageInspector, NetworkProvider, PowerController, RamdiskOptions,
    ServiceCatalog,
};
use crate::config::DeployConfig;
use crate::deploy::{
    AgentDeployVendor, AsyncContinuationHandler, DeployError, DeployParameters, DeployResult,
    DeploymentOrchestrator, DiskWriter, FailureRollbackPolicy,
};
use crate::heartbeat::HeartbeatDispatcher;
use crate::images::{CacheCleanup, ImageArtifacts, InstanceImageCacheSettings, InstanceImageStore};
use crate::lock::{MachineLocks, MachineTask};
use crate::machine::{Machine, MachineStore, MemoryMachineStore};
use crate::ws::AgentConnectionManager;

#[derive(Default)]
pub struct FakePower {
    actions: Mutex<Vec<(Uuid, PowerAction)>>,
    fail_next: AtomicBool,
}

impl FakePower {
    pub fn actions(&self) -> Vec<(Uuid, PowerAction)> {
        self.actions.lock().unwrap().clone()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PowerController for FakePower {
    async fn power_action(&self, machine: &Machine, action: PowerAction) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Power(format!("BMC of {} not responding", machine.uuid)));
        }
        self.actions.lock().unwrap().push((machine.uuid, action));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBoot {
    calls: Mutex<Vec<String>>,
    ramdisk_options: Mutex<Option<RamdiskOptions>>,
}

impl FakeBoot {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_ramdisk_options(&self) -> Option<RamdiskOptions> {
        self.ramdisk_options.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl BootInterface for FakeBoot {
    async fn validate(&self, _machine: &Machine) -> std::result::Result<(), DeployError> {
        self.record("validate");
        Ok(())
    }

    async fn prepare_ramdisk(&self, _machine: &Machine, options: &RamdiskOptions) -> Result<()> {
        self.record("prepare_ramdisk");
        *self.ramdisk_options.lock().unwrap() = Some(options.clone());
        Ok(())
    }

    async fn prepare_instance(&self, _machine: &Machine) -> Result<()> {
        self.record("prepare_instance");
        Ok(())
    }

    async fn clean_up_ramdisk(&self, _machine: &Machine) -> Result<()> {
        self.record("clean_up_ramdisk");
        Ok(())
    }

    async fn clean_up_instance(&self, _machine: &Machine) -> Result<()> {
        self.record("clean_up_instance");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeNetwork {
    removed: Mutex<Vec<Vec<String>>>,
    dhcp_cleanups: AtomicUsize,
}

impl FakeNetwork {
    pub fn removed_ports(&self) -> Vec<Vec<String>> {
        self.removed.lock().unwrap().clone()
    }

    pub fn dhcp_cleanups(&self) -> usize {
        self.dhcp_cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkProvider for FakeNetwork {
    async fn clean_dhcp(&self, _machine: &Machine) -> Result<()> {
        self.dhcp_cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_cleaning_network(&self, _machine: &Machine) -> Result<Vec<String>> {
        Ok(vec!["cleaning-port-1".to_string()])
    }

    async fn remove_cleaning_network(&self, _machine: &Machine, ports: &[String]) -> Result<()> {
        self.removed.lock().unwrap().push(ports.to_vec());
        Ok(())
    }
}

pub struct FakeCatalog {
    url: Option<String>,
}

impl FakeCatalog {
    pub fn with_url(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
        }
    }

    pub fn unavailable() -> Self {
        Self { url: None }
    }
}

#[async_trait]
impl ServiceCatalog for FakeCatalog {
    async fn service_url(&self, service_type: &str) -> Result<String> {
        self.url
            .clone()
            .ok_or_else(|| Error::NotFound(format!("no endpoint for service type {}", service_type)))
    }
}

pub struct FakeInspector {
    size_mb: AtomicU64,
}

impl FakeInspector {
    pub fn set_size_mb(&self, size_mb: u64) {
        self.size_mb.store(size_mb, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageInspector for FakeInspector {
    async fn virtual_size_mb(&self, _path: &Path) -> Result<u64> {
        Ok(self.size_mb.load(Ordering::SeqCst))
    }
}

/// 拉取时在目标路径写一个小文件
#[derive(Default)]
pub struct FakeImageStore {
    fetched: Mutex<Vec<(String, PathBuf, bool)>>,
    settings: Mutex<Option<InstanceImageCacheSettings>>,
    cleanups: AtomicUsize,
}

impl FakeImageStore {
    pub fn fetched(&self) -> Vec<(String, PathBuf, bool)> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn last_settings(&self) -> Option<InstanceImageCacheSettings> {
        self.settings.lock().unwrap().clone()
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheCleanup for FakeImageStore {
    fn name(&self) -> &str {
        "instance"
    }

    async fn clean_up(&self, _amount: Option<u64>) -> Result<u64> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

#[async_trait]
impl InstanceImageStore for FakeImageStore {
    async fn source_size(&self, _image_source: &str) -> Result<u64> {
        Ok(1024)
    }

    async fn fetch(&self, image_source: &str, dest: &Path, settings: &InstanceImageCacheSettings) -> Result<()> {
        tokio::fs::write(dest, b"raw image").await?;
        self.fetched
            .lock()
            .unwrap()
            .push((image_source.to_string(), dest.to_path_buf(), settings.force_raw));
        *self.settings.lock().unwrap() = Some(settings.clone());
        Ok(())
    }
}

pub struct FakeWriter {
    outcome: Mutex<std::result::Result<DeployResult, String>>,
    params: Mutex<Vec<DeployParameters>>,
}

impl FakeWriter {
    fn new(result: DeployResult) -> Self {
        Self {
            outcome: Mutex::new(Ok(result)),
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn returns(&self, result: DeployResult) {
        *self.outcome.lock().unwrap() = Ok(result);
    }

    pub fn fails(&self, error: &str) {
        *self.outcome.lock().unwrap() = Err(error.to_string());
    }

    pub fn calls(&self) -> usize {
        self.params.lock().unwrap().len()
    }

    pub fn last_params(&self) -> Option<DeployParameters> {
        self.params.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl DiskWriter for FakeWriter {
    async fn write(&self, params: &DeployParameters) -> Result<DeployResult> {
        self.params.lock().unwrap().push(params.clone());
        self.outcome.lock().unwrap().clone().map_err(Error::Storage)
    }
}

pub struct FakeAgent {
    iscsi: Mutex<Vec<StartIscsiTargetRequest>>,
    bootloader: Mutex<Vec<InstallBootloaderRequest>>,
    clean_steps: Mutex<Vec<String>>,
    iscsi_status: Mutex<CommandStatus>,
    bootloader_status: Mutex<CommandStatus>,
    clean_step_status: Mutex<CommandStatus>,
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self {
            iscsi: Mutex::default(),
            bootloader: Mutex::default(),
            clean_steps: Mutex::default(),
            iscsi_status: Mutex::new(CommandStatus::Succeeded),
            bootloader_status: Mutex::new(CommandStatus::Succeeded),
            clean_step_status: Mutex::new(CommandStatus::Running),
        }
    }
}

impl FakeAgent {
    pub fn iscsi_requests(&self) -> Vec<StartIscsiTargetRequest> {
        self.iscsi.lock().unwrap().clone()
    }

    pub fn bootloader_requests(&self) -> Vec<InstallBootloaderRequest> {
        self.bootloader.lock().unwrap().clone()
    }

    pub fn clean_steps_executed(&self) -> Vec<String> {
        self.clean_steps.lock().unwrap().clone()
    }

    pub fn set_iscsi_status(&self, status: CommandStatus) {
        *self.iscsi_status.lock().unwrap() = status;
    }

    pub fn set_bootloader_status(&self, status: CommandStatus) {
        *self.bootloader_status.lock().unwrap() = status;
    }

    pub fn set_clean_step_status(&self, status: CommandStatus) {
        *self.clean_step_status.lock().unwrap() = status;
    }

    fn result(name: &str, status: CommandStatus) -> CommandResult {
        CommandResult {
            command_name: name.to_string(),
            command_status: status,
            command_error: (status == CommandStatus::Failed).then(|| serde_json::json!("agent command failed")),
            command_result: None,
        }
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn start_iscsi_target(
        &self,
        _machine: &Machine,
        request: &StartIscsiTargetRequest,
    ) -> Result<CommandResult> {
        self.iscsi.lock().unwrap().push(request.clone());
        let status = *self.iscsi_status.lock().unwrap();
        Ok(Self::result("iscsi.start_iscsi_target", status))
    }

    async fn install_bootloader(
        &self,
        _machine: &Machine,
        request: &InstallBootloaderRequest,
    ) -> Result<CommandResult> {
        self.bootloader.lock().unwrap().push(request.clone());
        let status = *self.bootloader_status.lock().unwrap();
        Ok(Self::result("image.install_bootloader", status))
    }

    async fn execute_clean_step(&self, _machine: &Machine, step: &CleanStep) -> Result<CommandResult> {
        self.clean_steps.lock().unwrap().push(step.step.clone());
        let status = *self.clean_step_status.lock().unwrap();
        Ok(Self::result("clean.execute_clean_step", status))
    }
}

pub const AGENT_URL: &str = "http://192.168.1.20:9999";

/// 组装好的部署核心，协作方全部为假实现
pub struct Harness {
    _dir: TempDir,
    pub config: Arc<DeployConfig>,
    pub store: Arc<dyn MachineStore>,
    memory: MemoryMachineStore,
    pub locks: MachineLocks,
    pub artifacts: Arc<ImageArtifacts>,
    pub rollback: Arc<FailureRollbackPolicy>,
    pub continuation: Arc<AsyncContinuationHandler>,
    pub vendor: Arc<AgentDeployVendor>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub dispatcher: HeartbeatDispatcher,
    pub power: Arc<FakePower>,
    pub boot: Arc<FakeBoot>,
    pub network: Arc<FakeNetwork>,
    pub inspector: Arc<FakeInspector>,
    pub image_store: Arc<FakeImageStore>,
    pub agent: Arc<FakeAgent>,
    pub whole_disk_writer: Arc<FakeWriter>,
    pub partition_writer: Arc<FakeWriter>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|_| {}, FakeCatalog::with_url("http://catalog.example.com:6385"))
    }

    pub fn with_config(customize: impl FnOnce(&mut DeployConfig)) -> Self {
        Self::build(customize, FakeCatalog::with_url("http://catalog.example.com:6385"))
    }

    pub fn with_catalog_unavailable() -> Self {
        Self::build(|_| {}, FakeCatalog::unavailable())
    }

    fn build(customize: impl FnOnce(&mut DeployConfig), catalog: FakeCatalog) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DeployConfig {
            images_path: dir.path().join("images"),
            instance_master_path: Some(dir.path().join("master_images")),
            ..Default::default()
        };
        customize(&mut config);

        let memory = MemoryMachineStore::new();
        let store: Arc<dyn MachineStore> = Arc::new(memory.clone());
        let power = Arc::new(FakePower::default());
        let boot = Arc::new(FakeBoot::default());
        let network = Arc::new(FakeNetwork::default());
        let inspector = Arc::new(FakeInspector {
            size_mb: AtomicU64::new(1024),
        });
        let image_store = Arc::new(FakeImageStore::default());
        let agent = Arc::new(FakeAgent::default());
        let whole_disk_writer = Arc::new(FakeWriter::new(DeployResult::WholeDisk {
            disk_identifier: Some("0x12345678".to_string()),
        }));
        let partition_writer = Arc::new(FakeWriter::new(DeployResult::Partition {
            root_uuid: Some("root-uuid-1".to_string()),
            efi_system_partition_uuid: Some(None),
        }));

        let collaborators = Collaborators {
            power: power.clone(),
            boot: boot.clone(),
            network: network.clone(),
            catalog: Arc::new(catalog),
            inspector: inspector.clone(),
            image_store: image_store.clone(),
            whole_disk_writer: whole_disk_writer.clone(),
            partition_writer: partition_writer.clone(),
        };
        let state = AppState::from_parts(
            config,
            store.clone(),
            collaborators,
            AgentConnectionManager::new(),
            agent.clone(),
        );

        Self {
            _dir: dir,
            config: state.config,
            store,
            memory,
            locks: state.locks,
            artifacts: state.artifacts,
            rollback: state.rollback,
            continuation: state.continuation,
            vendor: state.vendor,
            orchestrator: state.orchestrator,
            dispatcher: state.dispatcher,
            power,
            boot,
            network,
            inspector,
            image_store,
            agent,
            whole_disk_writer,
            partition_writer,
        }
    }

    pub fn partition_machine(&self, state: ProvisionState) -> Machine {
        let mut machine = Machine::new(Uuid::new_v4(), state);
        machine.instance_uuid = Some(Uuid::new_v4());
        machine.driver = "agent_ipmitool".to_string();
        machine.driver_internal_info.is_whole_disk_image = Some(false);
        machine.driver_internal_info.agent_url = Some(AGENT_URL.to_string());
        machine.instance_info.image_source = Some("glance://image-1".to_string());
        machine.instance_info.root_gb = Some(10);
        machine.instance_info.swap_mb = Some(512);
        machine
    }

    pub fn whole_disk_machine(&self, state: ProvisionState) -> Machine {
        let mut machine = Machine::new(Uuid::new_v4(), state);
        machine.instance_uuid = Some(Uuid::new_v4());
        machine.driver = "agent_ipmitool".to_string();
        machine.driver_internal_info.is_whole_disk_image = Some(true);
        machine.driver_internal_info.agent_url = Some(AGENT_URL.to_string());
        machine.instance_info.image_source = Some("glance://disk-1".to_string());
        machine
    }

    pub async fn insert(&self, machine: Machine) {
        self.memory.insert(machine).await;
    }

    /// 保存机器并持有其排他锁
    pub async fn exclusive_task(&self, machine: Machine) -> MachineTask {
        let uuid = machine.uuid;
        self.insert(machine).await;
        MachineTask::exclusive(&self.locks, self.store.clone(), &uuid).await.unwrap()
    }

    pub async fn load(&self, uuid: &Uuid) -> Machine {
        self.store.load(uuid).await.unwrap()
    }

    pub fn writer_calls(&self) -> usize {
        self.whole_disk_writer.calls() + self.partition_writer.calls()
    }
}
