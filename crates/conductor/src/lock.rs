//! 机器锁与任务上下文
//!
//! 同一台机器的部署、拆除与续部署必须串行执行。锁由调用方获取，
//! 需要排他锁的操作只检查 `MachineTask` 是否持有锁，不自行加锁

use common::models::ProvisionEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::deploy::DeployError;
use crate::machine::{Machine, MachineStore};

/// 每台机器一把排他锁
#[derive(Clone, Default)]
pub struct MachineLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl MachineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出机器的锁，顺带清掉没有持有者也没有等待者的条目
    ///
    /// 克隆只发生在表锁内，所以引用计数为 1 的条目不会被并发取走
    async fn entry(&self, uuid: &Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(*uuid).or_default().clone()
    }

    /// 当前登记的机器数
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// 等待直到获得锁
    pub async fn acquire(&self, uuid: &Uuid) -> OwnedMutexGuard<()> {
        self.entry(uuid).await.lock_owned().await
    }

    /// 锁被占用时立即返回 `None`
    pub async fn try_acquire(&self, uuid: &Uuid) -> Option<OwnedMutexGuard<()>> {
        self.entry(uuid).await.try_lock_owned().ok()
    }
}

/// 针对一台机器的工作单元
pub struct MachineTask {
    pub machine: Machine,
    store: Arc<dyn MachineStore>,
    lock: Option<OwnedMutexGuard<()>>,
}

impl MachineTask {
    /// 共享访问，不持有锁
    pub async fn shared(store: Arc<dyn MachineStore>, uuid: &Uuid) -> Result<Self, DeployError> {
        let machine = store.load(uuid).await?;
        Ok(Self {
            machine,
            store,
            lock: None,
        })
    }

    /// 获取排他锁后再加载机器记录，保证读到前一个持锁者写入的状态
    pub async fn exclusive(
        locks: &MachineLocks,
        store: Arc<dyn MachineStore>,
        uuid: &Uuid,
    ) -> Result<Self, DeployError> {
        let guard = locks.acquire(uuid).await;
        Self::with_guard(guard, store, uuid).await
    }

    /// 与 `exclusive` 相同，但锁被占用时返回 `MachineLocked`
    pub async fn try_exclusive(
        locks: &MachineLocks,
        store: Arc<dyn MachineStore>,
        uuid: &Uuid,
    ) -> Result<Self, DeployError> {
        let guard = locks
            .try_acquire(uuid)
            .await
            .ok_or(DeployError::MachineLocked(*uuid))?;
        Self::with_guard(guard, store, uuid).await
    }

    async fn with_guard(
        guard: OwnedMutexGuard<()>,
        store: Arc<dyn MachineStore>,
        uuid: &Uuid,
    ) -> Result<Self, DeployError> {
        let machine = store.load(uuid).await?;
        debug!(machine = %uuid, "acquired exclusive lock");
        Ok(Self {
            machine,
            store,
            lock: Some(guard),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.machine.uuid
    }

    pub fn is_exclusive(&self) -> bool {
        self.lock.is_some()
    }

    pub fn require_exclusive_lock(&self, operation: &'static str) -> Result<(), DeployError> {
        if self.is_exclusive() {
            Ok(())
        } else {
            Err(DeployError::LockNotHeld {
                machine: self.machine.uuid,
                operation,
            })
        }
    }

    /// 驱动状态机，仅修改内存中的记录
    pub fn process_event(&mut self, event: ProvisionEvent) -> Result<(), DeployError> {
        let current = self.machine.provision_state;
        let next = current.next(event).ok_or(DeployError::InvalidState {
            machine: self.machine.uuid,
            state: current,
            event,
        })?;
        debug!(machine = %self.machine.uuid, from = %current, to = %next, ?event, "provision state transition");
        self.machine.provision_state = next;
        Ok(())
    }

    pub async fn save(&self) -> Result<(), DeployError> {
        self.store.save(&self.machine).await?;
        Ok(())
    }
}
