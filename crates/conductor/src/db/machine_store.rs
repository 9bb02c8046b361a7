/// 基于 SeaORM 的机器存储

use async_trait::async_trait;
use chrono::Utc;
use common::{Error, Result};
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, Set};
use tracing::debug;
use uuid::Uuid;

use super::models::machine::{ActiveModel as MachineActiveModel, Entity as MachineEntity};
use crate::machine::{Machine, MachineStore};

fn db_error(err: DbErr) -> Error {
    Error::Database(err.to_string())
}

pub struct SeaOrmMachineStore {
    db: DatabaseConnection,
}

impl SeaOrmMachineStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn into_inner(self) -> DatabaseConnection {
        self.db
    }
}

#[async_trait]
impl MachineStore for SeaOrmMachineStore {
    async fn load(&self, uuid: &Uuid) -> Result<Machine> {
        let model = MachineEntity::find_by_id(uuid.to_string())
            .one(&self.db)
            .await
            .map_err(db_error)?
            .ok_or_else(|| Error::NotFound(format!("machine {} not found", uuid)))?;

        Machine::try_from(model)
    }

    /// 只回写部署核心会修改的字段
    async fn save(&self, machine: &Machine) -> Result<()> {
        let model = MachineEntity::find_by_id(machine.uuid.to_string())
            .one(&self.db)
            .await
            .map_err(db_error)?
            .ok_or_else(|| Error::NotFound(format!("machine {} not found", machine.uuid)))?;

        let mut active: MachineActiveModel = model.into();
        active.provision_state = Set(machine.provision_state.as_str().to_string());
        active.target_provision_state = Set(machine.target_provision_state.map(|s| s.as_str().to_string()));
        active.last_error = Set(machine.last_error.clone());
        active.instance_info = Set(serde_json::to_value(&machine.instance_info)?);
        active.driver_internal_info = Set(serde_json::to_value(&machine.driver_internal_info)?);
        active.updated_at = Set(Utc::now().into());

        active.update(&self.db).await.map_err(db_error)?;
        debug!("Saved machine {}", machine.uuid);
        Ok(())
    }
}
