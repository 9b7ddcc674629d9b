//! 引擎配置。
//!
//! # 设计背景（Why）
//! - 线程数、缓冲大小、超时预算集中成一份可序列化结构，
//!   由宿主从 TOML 加载后显式传入 [`crate::context::EngineContext`]；
//! - 配置文件语法本身不在引擎范围内，这里只负责反序列化与校验。
//!
//! # 契约说明（What）
//! - 缺省字段取 [`EngineConfig::default`] 中的值；
//! - 超时字段以毫秒计，`0` 表示关闭对应预算；
//! - [`EngineConfig::validate`] 拒绝零值的线程数与缓冲大小，并把超出范围的清扫间隔夹回区间内。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, codes};

/// 清扫间隔允许的最小值（毫秒）。
pub const MIN_SWEEP_INTERVAL_MS: u64 = 10;
/// 清扫间隔允许的最大值（毫秒）。
pub const MAX_SWEEP_INTERVAL_MS: u64 = 60_000;

/// 配置加载与校验错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse engine config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid engine config: `{field}` {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<ConfigError> for CoreError {
    fn from(value: ConfigError) -> Self {
        let code = match value {
            ConfigError::Parse(_) => codes::CONFIG_PARSE,
            ConfigError::Invalid { .. } => codes::CONFIG_INVALID,
        };
        CoreError::new(code, value.to_string()).with_cause(value)
    }
}

/// 连接超时预算。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// 注册到连接建立完成。
    pub connect_ms: u64,
    /// 两次成功读取之间的最长间隔。
    pub recv_ms: u64,
    /// 写出排队后到完全冲刷的最长时间。
    pub send_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 3_000,
            recv_ms: 60_000,
            send_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Option<Duration> {
        budget(self.connect_ms)
    }

    pub fn recv(&self) -> Option<Duration> {
        budget(self.recv_ms)
    }

    pub fn send(&self) -> Option<Duration> {
        budget(self.send_ms)
    }

    /// 全部关闭，常用于测试。
    pub fn disabled() -> Self {
        Self {
            connect_ms: 0,
            recv_ms: 0,
            send_ms: 0,
        }
    }
}

fn budget(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// 引擎整体配置。
///
/// ```rust
/// use fai_core::config::EngineConfig;
///
/// let config = EngineConfig::from_toml_str(
///     r#"
///     event_loops = 2
///     [timeouts]
///     recv_ms = 500
///     "#,
/// )
/// .unwrap();
/// assert_eq!(config.event_loops, 2);
/// assert_eq!(config.timeouts.recv_ms, 500);
/// assert_eq!(config.timeouts.connect_ms, 3_000);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 反应器线程数。
    pub event_loops: usize,
    /// Actor 工作线程数。
    pub actor_workers: usize,
    /// 单次 poll 可返回的就绪事件上限。
    pub events_capacity: usize,
    /// 每次套接字读取使用的缓冲大小。
    pub read_buffer_size: usize,
    /// 空闲清扫周期（毫秒）。
    pub sweep_interval_ms: u64,
    /// FAI 帧（头 + 扩展 + 体）的最大字节数。
    pub max_frame_length: usize,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
    pub timeouts: TimeoutConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_loops: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(2),
            actor_workers: 4,
            events_capacity: 1024,
            read_buffer_size: 16 * 1024,
            sweep_interval_ms: 1_000,
            max_frame_length: 8 * 1024 * 1024,
            tcp_nodelay: true,
            tcp_keepalive: true,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 从 TOML 文本反序列化并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()
    }

    /// 校验并规范化配置。
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        for (field, value) in [
            ("event_loops", self.event_loops),
            ("actor_workers", self.actor_workers),
            ("events_capacity", self.events_capacity),
            ("read_buffer_size", self.read_buffer_size),
            ("max_frame_length", self.max_frame_length),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        let clamped = self
            .sweep_interval_ms
            .clamp(MIN_SWEEP_INTERVAL_MS, MAX_SWEEP_INTERVAL_MS);
        if clamped != self.sweep_interval_ms {
            tracing::warn!(
                requested = self.sweep_interval_ms,
                applied = clamped,
                "sweep_interval_ms out of range; clamped"
            );
            self.sweep_interval_ms = clamped;
        }
        Ok(self)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn zero_sized_pools_are_rejected() {
        let err = EngineConfig::from_toml_str("event_loops = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "event_loops",
                ..
            }
        ));
        let core: CoreError = err.into();
        assert_eq!(core.code(), codes::CONFIG_INVALID);
    }

    #[test]
    fn malformed_toml_maps_to_parse_code() {
        let err = EngineConfig::from_toml_str("event_loops = \"many\"").unwrap_err();
        let core: CoreError = err.into();
        assert_eq!(core.code(), codes::CONFIG_PARSE);
    }

    #[test]
    #[traced_test]
    fn sweep_interval_is_clamped_with_a_warning() {
        let config = EngineConfig::from_toml_str("sweep_interval_ms = 1").unwrap();
        assert_eq!(config.sweep_interval_ms, MIN_SWEEP_INTERVAL_MS);
        assert!(logs_contain("sweep_interval_ms out of range"));
    }

    #[test]
    fn zero_timeouts_disable_budgets() {
        let timeouts = TimeoutConfig::disabled();
        assert_eq!(timeouts.recv(), None);
        assert_eq!(TimeoutConfig::default().send(), Some(Duration::from_secs(10)));
    }
}
