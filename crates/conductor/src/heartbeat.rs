/// 代理心跳分发
/// 
/// 心跳是触发续部署的唯一入口。这里是“发出即不管”的边界：
/// 续部署的错误在回滚完成后只记录日志，不再向上传播

use common::models::ProvisionState;
use common::ws_rpc::{CleanStepsNotification, HeartbeatNotification};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::deploy::{AgentDeployVendor, DeployError};
use crate::lock::{MachineLocks, MachineTask};
use crate::machine::MachineStore;

/// 一次心跳的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// 机器被其他操作锁定，本次心跳跳过
    Busy,
    /// 只记录了心跳
    Recorded,
    DeployContinued,
    /// 续部署失败，机器已回滚
    DeployFailed(String),
    /// 机器不存在或心跳无法记录
    Ignored(String),
}

#[derive(Clone)]
pub struct HeartbeatDispatcher {
    locks: MachineLocks,
    store: Arc<dyn MachineStore>,
    vendor: Arc<AgentDeployVendor>,
}

impl HeartbeatDispatcher {
    pub fn new(locks: MachineLocks, store: Arc<dyn MachineStore>, vendor: Arc<AgentDeployVendor>) -> Self {
        Self { locks, store, vendor }
    }

    /// 处理一次心跳
    ///
    /// 不等待锁：机器正被其他操作处理时，下一次心跳会再来
    pub async fn on_heartbeat(&self, beat: HeartbeatNotification) -> HeartbeatOutcome {
        let uuid = beat.machine_id;
        let mut task = match MachineTask::try_exclusive(&self.locks, self.store.clone(), &uuid).await {
            Ok(task) => task,
            Err(DeployError::MachineLocked(_)) => {
                debug!("Machine {} is busy, skipping heartbeat", uuid);
                return HeartbeatOutcome::Busy;
            }
            Err(e) => {
                warn!("Ignoring heartbeat from machine {}: {}", uuid, e);
                return HeartbeatOutcome::Ignored(e.to_string());
            }
        };

        if let Some(agent_url) = beat.agent_url {
            task.machine.driver_internal_info.agent_url = Some(agent_url);
        }
        task.machine.driver_internal_info.agent_last_heartbeat = Some(beat.timestamp);
        if let Err(e) = task.save().await {
            warn!("Failed to record heartbeat of machine {}: {}", uuid, e);
            return HeartbeatOutcome::Ignored(e.to_string());
        }

        if task.machine.provision_state != ProvisionState::DeployWait {
            debug!("Heartbeat from machine {} in state {}", uuid, task.machine.provision_state);
            return HeartbeatOutcome::Recorded;
        }

        info!("Agent on machine {} is ready, continuing deploy", uuid);
        match self.vendor.continue_deploy(&mut task).await {
            Ok(_) => HeartbeatOutcome::DeployContinued,
            Err(e) => {
                error!("Asynchronous exception while continuing deploy of machine {}: {}", uuid, e);
                HeartbeatOutcome::DeployFailed(e.to_string())
            }
        }
    }

    /// 缓存代理上报的清理步骤
    pub async fn on_clean_steps(&self, notification: CleanStepsNotification) {
        let uuid = notification.machine_id;
        let mut task = match MachineTask::exclusive(&self.locks, self.store.clone(), &uuid).await {
            Ok(task) => task,
            Err(e) => {
                warn!("Ignoring clean steps from machine {}: {}", uuid, e);
                return;
            }
        };

        let count: usize = notification.clean_steps.values().map(Vec::len).sum();
        task.machine.driver_internal_info.agent_cached_clean_steps = Some(notification.clean_steps);
        match task.save().await {
            Ok(()) => info!("Cached {} clean steps for machine {}", count, uuid),
            Err(e) => warn!("Failed to cache clean steps of machine {}: {}", uuid, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::DeployResult;
    use crate::images::image_file_path;
    use crate::test_support::Harness;
    use common::ws_rpc::CleanStep;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn beat(machine_id: Uuid) -> HeartbeatNotification {
        HeartbeatNotification {
            machine_id,
            agent_url: Some("http://192.168.1.20:9999".to_string()),
            timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_records_agent() {
        let harness = Harness::new();
        let mut machine = harness.partition_machine(ProvisionState::Active);
        machine.driver_internal_info.agent_url = None;
        let uuid = machine.uuid;
        harness.insert(machine).await;

        assert_eq!(harness.dispatcher.on_heartbeat(beat(uuid)).await, HeartbeatOutcome::Recorded);
        let saved = harness.load(&uuid).await;
        assert_eq!(saved.driver_internal_info.agent_url.as_deref(), Some("http://192.168.1.20:9999"));
        assert_eq!(saved.driver_internal_info.agent_last_heartbeat, Some(1_700_000_000));
        assert!(harness.agent.iscsi_requests().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_skips_locked_machine() {
        let harness = Harness::new();
        let machine = harness.partition_machine(ProvisionState::DeployWait);
        let uuid = machine.uuid;
        harness.insert(machine).await;

        let _held = harness.locks.acquire(&uuid).await;
        assert_eq!(harness.dispatcher.on_heartbeat(beat(uuid)).await, HeartbeatOutcome::Busy);
        assert!(harness.load(&uuid).await.driver_internal_info.agent_last_heartbeat.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_machine() {
        let harness = Harness::new();
        assert!(matches!(
            harness.dispatcher.on_heartbeat(beat(Uuid::new_v4())).await,
            HeartbeatOutcome::Ignored(_)
        ));
    }

    #[tokio::test]
    async fn test_full_deploy_flow() {
        let harness = Harness::new();
        let machine = harness.partition_machine(ProvisionState::Deploying);
        let uuid = machine.uuid;

        {
            let mut task = harness.exclusive_task(machine).await;
            let state = harness.orchestrator.deploy(&mut task).await.unwrap();
            task.process_event(common::models::ProvisionEvent::Wait).unwrap();
            assert_eq!(task.machine.provision_state, state);
            task.save().await.unwrap();
        }
        assert!(image_file_path(&harness.config, &uuid).exists());

        assert_eq!(
            harness.dispatcher.on_heartbeat(beat(uuid)).await,
            HeartbeatOutcome::DeployContinued
        );

        let saved = harness.load(&uuid).await;
        assert_eq!(saved.provision_state, ProvisionState::Active);
        assert_eq!(saved.driver_internal_info.root_uuid_or_disk_id.as_deref(), Some("root-uuid-1"));
        assert!(!image_file_path(&harness.config, &uuid).exists());
    }

    #[tokio::test]
    async fn test_failed_continuation_is_contained() {
        let harness = Harness::new();
        harness.partition_writer.fails("I/O error");
        let machine = harness.partition_machine(ProvisionState::DeployWait);
        let uuid = machine.uuid;
        harness.insert(machine).await;

        let outcome = harness.dispatcher.on_heartbeat(beat(uuid)).await;
        assert!(matches!(outcome, HeartbeatOutcome::DeployFailed(ref msg) if msg.contains("I/O error")));

        let saved = harness.load(&uuid).await;
        assert_eq!(saved.provision_state, ProvisionState::DeployFailed);
        assert!(saved.last_error.unwrap().contains("I/O error"));

        // 锁已释放
        assert!(harness.locks.try_acquire(&uuid).await.is_some());
    }

    #[tokio::test]
    async fn test_partition_writer_result_passthrough() {
        let harness = Harness::new();
        harness.partition_writer.returns(DeployResult::Partition {
            root_uuid: Some("abc".to_string()),
            efi_system_partition_uuid: None,
        });
        let machine = harness.partition_machine(ProvisionState::DeployWait);
        let uuid = machine.uuid;
        harness.insert(machine).await;

        assert_eq!(harness.dispatcher.on_heartbeat(beat(uuid)).await, HeartbeatOutcome::DeployContinued);
        assert_eq!(
            harness.load(&uuid).await.driver_internal_info.root_uuid_or_disk_id.as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn test_clean_steps_cached() {
        let harness = Harness::new();
        let machine = harness.partition_machine(ProvisionState::CleanWait);
        let uuid = machine.uuid;
        harness.insert(machine).await;

        let step = CleanStep {
            step: "erase_devices".to_string(),
            interface: "deploy".to_string(),
            priority: 10,
            abortable: true,
            reboot_requested: false,
            args: Default::default(),
        };
        harness
            .dispatcher
            .on_clean_steps(CleanStepsNotification {
                machine_id: uuid,
                clean_steps: HashMap::from([("deploy".to_string(), vec![step])]),
            })
            .await;

        let saved = harness.load(&uuid).await;
        let steps = harness.orchestrator.get_clean_steps(&saved).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step, "erase_devices");
    }
}
