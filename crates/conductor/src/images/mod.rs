/// 机器工作目录中的实例镜像
/// 
/// 每台机器在 `images_path/<uuid>/disk` 下有且只有一个镜像文件，
/// 部署开始时创建，续部署结束后删除

mod cache;

pub use cache::{
    CacheCleanup, CacheMaintenanceCoordinator, InstanceImageCacheSettings, InstanceImageStore,
    INSTANCE_IMAGE_CACHE_PRIORITY,
};

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::ImageInspector;
use crate::config::DeployConfig;
use crate::deploy::{parse_instance_info, DeployError};
use crate::machine::Machine;

const IMAGE_FILE_NAME: &str = "disk";

/// 机器的镜像目录
pub fn image_dir_path(config: &DeployConfig, machine_uuid: &Uuid) -> PathBuf {
    config.images_path.join(machine_uuid.to_string())
}

/// 机器的镜像文件
pub fn image_file_path(config: &DeployConfig, machine_uuid: &Uuid) -> PathBuf {
    image_dir_path(config, machine_uuid).join(IMAGE_FILE_NAME)
}

/// 实例镜像的本地副本管理
pub struct ImageArtifacts {
    config: Arc<DeployConfig>,
    store: Arc<dyn InstanceImageStore>,
    maintenance: Arc<CacheMaintenanceCoordinator>,
    inspector: Arc<dyn ImageInspector>,
    cache_settings: InstanceImageCacheSettings,
}

impl ImageArtifacts {
    pub fn new(
        config: Arc<DeployConfig>,
        store: Arc<dyn InstanceImageStore>,
        maintenance: Arc<CacheMaintenanceCoordinator>,
        inspector: Arc<dyn ImageInspector>,
    ) -> Self {
        let cache_settings = InstanceImageCacheSettings::from_config(&config);
        Self {
            config,
            store,
            maintenance,
            inspector,
            cache_settings,
        }
    }

    /// 拉取实例镜像到机器的工作目录
    ///
    /// 返回镜像标识和本地路径
    pub async fn cache_instance_image(&self, machine: &Machine) -> Result<(String, PathBuf), DeployError> {
        let info = parse_instance_info(machine, &self.config)?;
        let image_dir = image_dir_path(&self.config, &machine.uuid);
        fs::create_dir_all(&image_dir).await.map_err(|e| {
            common::Error::Storage(format!("Failed to create image directory {}: {}", image_dir.display(), e))
        })?;

        let image_path = image_file_path(&self.config, &machine.uuid);
        debug!("Fetching image {} for machine {}", info.image_source, machine.uuid);

        let size = self.store.source_size(&info.image_source).await?;
        self.maintenance.ensure_space(&image_dir, size).await?;
        self.store
            .fetch(&info.image_source, &image_path, &self.cache_settings)
            .await?;

        info!("Cached image {} for machine {} at {}", info.image_source, machine.uuid, image_path.display());
        Ok((info.image_source, image_path))
    }

    /// 镜像虚拟大小不得超过请求的根分区大小
    ///
    /// 整盘镜像未指定根分区大小时不做检查
    pub async fn check_image_size(&self, machine: &Machine) -> Result<(), DeployError> {
        let info = parse_instance_info(machine, &self.config)?;
        let Some(root_gb) = info.root_gb else {
            debug!("No root size requested for machine {}, skipping image size check", machine.uuid);
            return Ok(());
        };

        let image_path = image_file_path(&self.config, &machine.uuid);
        let image_mb = self.inspector.virtual_size_mb(&image_path).await?;
        let root_mb = root_gb * 1024;
        if image_mb > root_mb {
            return Err(DeployError::OversizedImage { image_mb, root_mb });
        }
        Ok(())
    }

    /// 删除机器的镜像文件与目录，并触发实例缓存的维护
    ///
    /// 永不失败，所有错误只记录日志
    pub async fn destroy_images(&self, machine_uuid: &Uuid) {
        let image_path = image_file_path(&self.config, machine_uuid);
        match fs::remove_file(&image_path).await {
            Ok(()) => debug!("Removed image {}", image_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove image {}: {}", image_path.display(), e),
        }

        let image_dir = image_dir_path(&self.config, machine_uuid);
        match fs::remove_dir_all(&image_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove image directory {}: {}", image_dir.display(), e),
        }

        if let Err(e) = self.store.clean_up(None).await {
            warn!("Instance image cache maintenance failed: {}", e);
        }
    }
}
