/// 镜像缓存接口与缓存维护协调器

use async_trait::async_trait;
use common::utils::format_bytes;
use common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DeployConfig;

/// 实例镜像缓存在维护协调器中的优先级
pub const INSTANCE_IMAGE_CACHE_PRIORITY: u32 = 50;

/// 可以按需释放空间的缓存
#[async_trait]
pub trait CacheCleanup: Send + Sync {
    fn name(&self) -> &str;

    /// 清理过期条目；`amount` 为需要释放的字节数，返回实际释放的字节数
    async fn clean_up(&self, amount: Option<u64>) -> Result<u64>;
}

/// 实例镜像存储
///
/// 把源镜像拉取到共享的主缓存，再在机器工作目录中生成一份副本。
/// 主缓存的淘汰与并发控制由实现方负责
#[async_trait]
pub trait InstanceImageStore: CacheCleanup {
    /// 源镜像的下载大小（字节），用于拉取前的磁盘空间检查
    async fn source_size(&self, image_source: &str) -> Result<u64>;

    /// 按 `settings` 描述的主缓存拉取镜像并在 `dest` 生成副本
    async fn fetch(&self, image_source: &str, dest: &Path, settings: &InstanceImageCacheSettings) -> Result<()>;
}

/// 实例镜像缓存的配置描述
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceImageCacheSettings {
    /// `None` 表示禁用主缓存
    pub master_dir: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub ttl: Duration,
    /// 是否把镜像转换为 raw 格式
    pub force_raw: bool,
}

impl InstanceImageCacheSettings {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            master_dir: config.instance_master_path.clone(),
            max_size_bytes: config.master_cache_size_bytes(),
            ttl: config.master_cache_ttl(),
            force_raw: config.force_raw_images,
        }
    }
}

struct CleanupHandler {
    priority: u32,
    cache: Arc<dyn CacheCleanup>,
}

/// 缓存维护协调器
///
/// 进程内唯一，持有按优先级从高到低排列的清理处理器
#[derive(Default)]
pub struct CacheMaintenanceCoordinator {
    handlers: Vec<CleanupHandler>,
}

impl CacheMaintenanceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册清理处理器，优先级相同时保持注册顺序
    pub fn register(&mut self, priority: u32, cache: Arc<dyn CacheCleanup>) {
        let index = self
            .handlers
            .iter()
            .position(|h| h.priority < priority)
            .unwrap_or(self.handlers.len());
        debug!("Registering cache cleanup handler {} with priority {}", cache.name(), priority);
        self.handlers.insert(index, CleanupHandler { priority, cache });
    }

    /// 以固定优先级注册实例镜像缓存
    pub fn register_instance_cache(&mut self, store: Arc<dyn InstanceImageStore>) {
        self.register(INSTANCE_IMAGE_CACHE_PRIORITY, Arc::new(InstanceCacheCleanup(store)));
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.cache.name()).collect()
    }

    /// 依次调用处理器直到释放足够空间，返回仍未满足的字节数
    pub async fn free_space(&self, amount: u64) -> u64 {
        let mut remaining = amount;
        for handler in &self.handlers {
            if remaining == 0 {
                break;
            }
            match handler.cache.clean_up(Some(remaining)).await {
                Ok(freed) => {
                    debug!("Cache {} freed {} bytes", handler.cache.name(), freed);
                    remaining = remaining.saturating_sub(freed);
                }
                Err(e) => warn!("Cache {} failed to clean up: {}", handler.cache.name(), e),
            }
        }
        remaining
    }

    /// 确保目录所在文件系统至少有 `required` 字节可用，必要时先清理缓存
    pub async fn ensure_space(&self, directory: &Path, required: u64) -> Result<()> {
        let available = available_space(directory)?;
        if available >= required {
            return Ok(());
        }

        info!(
            "Not enough space in {} ({} available, {} required), cleaning up caches",
            directory.display(),
            format_bytes(available),
            format_bytes(required)
        );
        self.free_space(required - available).await;

        let available = available_space(directory)?;
        if available < required {
            return Err(Error::Storage(format!(
                "Disk volume where '{}' is located doesn't have enough disk space. Required {} MiB, only {} MiB available space present.",
                directory.display(),
                required / (1024 * 1024),
                available / (1024 * 1024)
            )));
        }
        Ok(())
    }
}

struct InstanceCacheCleanup(Arc<dyn InstanceImageStore>);

#[async_trait]
impl CacheCleanup for InstanceCacheCleanup {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn clean_up(&self, amount: Option<u64>) -> Result<u64> {
        self.0.clean_up(amount).await
    }
}

fn available_space(directory: &Path) -> Result<u64> {
    fs2::available_space(directory).map_err(|e| {
        Error::Storage(format!(
            "Failed to query free space of {}: {}",
            directory.display(),
            e
        ))
    })
}
