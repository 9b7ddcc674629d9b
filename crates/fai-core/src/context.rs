use std::sync::Arc;

use crate::{config::EngineConfig, error::CoreError, timer::Timer};

/// 进程级引擎上下文。
///
/// # 设计背景（Why）
/// - 共享资源不放在进程级静态变量里，而是由宿主创建本对象后传给事件循环组与各个过滤器，
///   初始化与销毁的时机都由宿主掌握，测试之间也不会互相污染。
///
/// # 契约说明（What）
/// - 持有已校验的 [`EngineConfig`] 与共享 [`Timer`]；
/// - 克隆共享同一份资源；[`EngineContext::shutdown`] 停止定时线程，可重复调用。
#[derive(Clone, Debug)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    timer: Timer,
}

impl EngineContext {
    /// 校验配置并启动共享定时器。
    pub fn new(config: EngineConfig) -> Result<Self, CoreError> {
        let config = config.validate()?;
        let timer = Timer::start("fai-timer")?;
        tracing::debug!(
            event_loops = config.event_loops,
            actor_workers = config.actor_workers,
            "engine context initialised"
        );
        Ok(Self {
            config: Arc::new(config),
            timer,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn shutdown(&self) {
        self.timer.shutdown();
    }
}
