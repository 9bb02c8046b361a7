/// 数据库访问层

pub mod machine_store;
pub mod models;

pub use machine_store::SeaOrmMachineStore;

use sea_orm::{Database, DatabaseConnection};
use tracing::info;

/// 建立数据库连接
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, anyhow::Error> {
    info!("Connecting to database");

    let db = Database::connect(database_url).await?;
    info!("Database connected");

    Ok(db)
}
