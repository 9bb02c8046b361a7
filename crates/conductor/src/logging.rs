/// 日志初始化

use tracing_subscriber::EnvFilter;

/// 初始化全局 tracing 订阅者
///
/// 优先使用 `RUST_LOG`，未设置时使用传入的默认级别。重复调用返回错误而不会 panic
pub fn init(default_level: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing: {}", e))
}
