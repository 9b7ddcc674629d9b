//! 连接的三类超时预算。
//!
//! # 设计背景（Why）
//! - 超时不靠逐操作的阻塞等待实现，而是由反应器周期性清扫：比较活动时间戳与当前时刻；
//! - 判定逻辑与套接字无关，抽成纯函数后可以不经网络直接验证。
//!
//! # 契约说明（What）
//! - 连接预算：从注册到 `Connected` 的时长；
//! - 接收预算：`Connected` 期间最近一次成功读之后的静默时长；
//! - 发送预算：写队列非空时，最近一次写出进展之后的停滞时长，每次有字节写出即重新计时；
//! - 预算为 `None` 表示禁用。

use std::time::{Duration, Instant};

use fai_core::{CoreError, codes, config::TimeoutConfig};

/// 清扫时使用的连接活动快照。
#[derive(Clone, Copy, Debug)]
pub(crate) struct Activity {
    pub registered_at: Instant,
    pub last_read: Instant,
    pub last_write_progress: Instant,
    pub establishing: bool,
    pub write_pending: bool,
}

impl Activity {
    pub fn new(now: Instant, establishing: bool) -> Self {
        Self {
            registered_at: now,
            last_read: now,
            last_write_progress: now,
            establishing,
            write_pending: false,
        }
    }

    /// 标记写队列自 `queued_at` 起非空。
    ///
    /// 发送预算从最近一次写出进展与队列变为非空两者中较晚的时刻起算，
    /// 长时间无写出的连接新排队一段字节后不会在首次 `WouldBlock` 时就被判超时。
    pub fn with_write_queued_at(self, queued_at: Instant) -> Self {
        Self {
            write_pending: true,
            last_write_progress: self.last_write_progress.max(queued_at),
            ..self
        }
    }
}

/// 已解析的超时预算。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TimeoutPolicy {
    connect: Option<Duration>,
    recv: Option<Duration>,
    send: Option<Duration>,
}

impl TimeoutPolicy {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            connect: config.connect(),
            recv: config.recv(),
            send: config.send(),
        }
    }

    /// 返回首个耗尽的预算对应的错误；连接阶段只检查连接预算。
    pub fn expired(&self, activity: &Activity, now: Instant) -> Option<CoreError> {
        let elapsed = |since: Instant, budget: Option<Duration>| {
            budget.filter(|budget| now.saturating_duration_since(since) >= *budget)
        };
        if activity.establishing {
            return elapsed(activity.registered_at, self.connect).map(|budget| {
                CoreError::new(
                    codes::TIMEOUT_CONNECT,
                    format!("connection not established within {budget:?}"),
                )
            });
        }
        if activity.write_pending
            && let Some(budget) = elapsed(activity.last_write_progress, self.send)
        {
            return Some(CoreError::new(
                codes::TIMEOUT_SEND,
                format!("queued writes made no progress for {budget:?}"),
            ));
        }
        elapsed(activity.last_read, self.recv).map(|budget| {
            CoreError::new(
                codes::TIMEOUT_RECV,
                format!("nothing received for {budget:?}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(connect: u64, recv: u64, send: u64) -> TimeoutPolicy {
        TimeoutPolicy::from_config(&TimeoutConfig {
            connect_ms: connect,
            recv_ms: recv,
            send_ms: send,
        })
    }

    #[test]
    fn establishing_connections_only_check_the_connect_budget() {
        let start = Instant::now();
        let activity = Activity::new(start, true);
        let policy = policy(100, 10, 10);
        assert!(policy.expired(&activity, start + Duration::from_millis(50)).is_none());
        let err = policy
            .expired(&activity, start + Duration::from_millis(100))
            .unwrap();
        assert_eq!(err.code(), codes::TIMEOUT_CONNECT);
        assert!(err.is_timeout());
    }

    #[test]
    fn recv_budget_counts_from_last_read() {
        let start = Instant::now();
        let mut activity = Activity::new(start, false);
        activity.last_read = start + Duration::from_millis(80);
        let policy = policy(0, 100, 0);
        assert!(policy.expired(&activity, start + Duration::from_millis(150)).is_none());
        let err = policy
            .expired(&activity, start + Duration::from_millis(180))
            .unwrap();
        assert_eq!(err.code(), codes::TIMEOUT_RECV);
    }

    #[test]
    fn send_budget_only_applies_with_pending_writes_and_resets_on_progress() {
        let start = Instant::now();
        let mut activity = Activity::new(start, false);
        let policy = policy(0, 0, 100);
        let later = start + Duration::from_millis(500);
        assert!(policy.expired(&activity, later).is_none());

        activity.write_pending = true;
        assert_eq!(
            policy.expired(&activity, later).unwrap().code(),
            codes::TIMEOUT_SEND
        );
        activity.last_write_progress = start + Duration::from_millis(450);
        assert!(policy.expired(&activity, later).is_none());
    }

    #[test]
    fn send_budget_starts_when_an_idle_queue_gets_bytes() {
        let start = Instant::now();
        let policy = policy(0, 0, 100);
        let queued_at = start + Duration::from_secs(10);
        let activity = Activity::new(start, false).with_write_queued_at(queued_at);
        assert!(activity.write_pending);
        assert!(
            policy
                .expired(&activity, queued_at + Duration::from_millis(50))
                .is_none()
        );
        let err = policy
            .expired(&activity, queued_at + Duration::from_millis(100))
            .unwrap();
        assert_eq!(err.code(), codes::TIMEOUT_SEND);

        // 排队之后的写出进展仍然向后推迟预算。
        let mut progressed = activity;
        progressed.last_write_progress = queued_at + Duration::from_millis(80);
        let progressed = progressed.with_write_queued_at(queued_at);
        assert!(
            policy
                .expired(&progressed, queued_at + Duration::from_millis(150))
                .is_none()
        );
    }

    #[test]
    fn zero_budgets_disable_checks() {
        let start = Instant::now();
        let activity = Activity::new(start, true);
        let far = start + Duration::from_secs(3600);
        assert!(policy(0, 0, 0).expired(&activity, far).is_none());
    }
}
