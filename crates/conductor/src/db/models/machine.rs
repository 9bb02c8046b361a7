/// 机器数据模型

use common::models::ProvisionState;
use common::Error;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::machine::Machine;

/// 机器表
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "machines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub instance_uuid: Option<String>,
    pub driver: String,
    pub provision_state: String,
    pub target_provision_state: Option<String>,
    pub last_error: Option<String>,

    // JSON 列
    pub properties: JsonValue,
    pub instance_info: JsonValue,
    pub driver_internal_info: JsonValue,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

fn parse_state(value: &str) -> common::Result<ProvisionState> {
    value.parse::<ProvisionState>().map_err(Error::Database)
}

fn parse_uuid(value: &str) -> common::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Database(format!("invalid uuid '{}': {}", value, e)))
}

/// 记录在加载时完成校验，JSON 列中的非法字段在这里报错
impl TryFrom<Model> for Machine {
    type Error = Error;

    fn try_from(model: Model) -> common::Result<Self> {
        Ok(Machine {
            uuid: parse_uuid(&model.id)?,
            instance_uuid: model.instance_uuid.as_deref().map(parse_uuid).transpose()?,
            driver: model.driver,
            provision_state: parse_state(&model.provision_state)?,
            target_provision_state: model
                .target_provision_state
                .as_deref()
                .map(parse_state)
                .transpose()?,
            last_error: model.last_error,
            properties: serde_json::from_value(model.properties)?,
            instance_info: serde_json::from_value(model.instance_info)?,
            driver_internal_info: serde_json::from_value(model.driver_internal_info)?,
        })
    }
}
