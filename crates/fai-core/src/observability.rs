//! 日志基础设施的安装入口。
//!
//! 库代码只通过 `tracing` 宏打点，从不自行安装 Subscriber；
//! 可执行程序或集成测试在入口处调用 [`init_tracing`] 一次即可。

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// 安装 `fmt + EnvFilter` Subscriber，过滤规则读取 `RUST_LOG`，缺省为 `info`。
///
/// # 契约说明（What）
/// - 幂等：重复调用直接返回首次结果；
/// - 返回 `false` 表示外部已设置全局 Subscriber，本次安装被跳过。
pub fn init_tracing() -> bool {
    *INSTALLED.get_or_init(|| {
        tracing_subscriber::registry()
            .with(build_env_filter())
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .try_init()
            .is_ok()
    })
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
