/// 机器记录的持久化接口

use async_trait::async_trait;
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Machine;

/// 机器记录存储
///
/// 记录归集群管理器所有，部署核心只读取并回写增量修改
#[async_trait]
pub trait MachineStore: Send + Sync + 'static {
    async fn load(&self, uuid: &Uuid) -> Result<Machine>;

    async fn save(&self, machine: &Machine) -> Result<()>;
}

/// 进程内的机器存储
#[derive(Debug, Clone, Default)]
pub struct MemoryMachineStore {
    machines: Arc<RwLock<HashMap<Uuid, Machine>>>,
}

impl MemoryMachineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, machine: Machine) {
        let mut machines = self.machines.write().await;
        machines.insert(machine.uuid, machine);
    }
}

#[async_trait]
impl MachineStore for MemoryMachineStore {
    async fn load(&self, uuid: &Uuid) -> Result<Machine> {
        let machines = self.machines.read().await;
        machines
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("machine {} not found", uuid)))
    }

    async fn save(&self, machine: &Machine) -> Result<()> {
        let mut machines = self.machines.write().await;
        match machines.get_mut(&machine.uuid) {
            Some(existing) => {
                *existing = machine.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("machine {} not found", machine.uuid))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::ProvisionState;

    #[tokio::test]
    async fn test_load_and_save() {
        let store = MemoryMachineStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(store.load(&id).await, Err(Error::NotFound(_))));

        store.insert(Machine::new(id, ProvisionState::Available)).await;
        let mut machine = store.load(&id).await.unwrap();
        machine.last_error = Some("boom".to_string());
        store.save(&machine).await.unwrap();

        assert_eq!(store.load(&id).await.unwrap().last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_save_unknown_machine() {
        let store = MemoryMachineStore::new();
        let machine = Machine::new(Uuid::new_v4(), ProvisionState::Available);
        assert!(store.save(&machine).await.is_err());
    }
}
