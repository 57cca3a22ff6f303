//! 中继参数（TTL、批量上限、长轮询窗口）

use std::time::Duration;

/// 中继配置
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 会话有效期，每次 join 续期
    pub session_ttl: Duration,
    /// 队列中单条消息的有效期，与会话过期无关
    pub message_ttl: Duration,
    /// 单次 poll 最多返回条数
    pub poll_max_batch: usize,
    /// 未指定 limit 时的默认条数
    pub poll_default_batch: usize,
    /// PC 超过该时长未出现即视为离线
    pub pc_stale_after: Duration,
    /// 长轮询总时长
    pub long_poll_window: Duration,
    /// 长轮询心跳间隔
    pub long_poll_heartbeat: Duration,
    /// 长轮询检查队列的间隔
    pub long_poll_check_interval: Duration,
    /// 投影时读取的事件历史上限
    pub event_history_limit: usize,
    /// 生成会话码的最大尝试次数
    pub session_id_attempts: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            message_ttl: Duration::from_secs(5 * 60),
            poll_max_batch: 50,
            poll_default_batch: 20,
            pc_stale_after: Duration::from_secs(2 * 60),
            long_poll_window: Duration::from_secs(25),
            long_poll_heartbeat: Duration::from_secs(5),
            long_poll_check_interval: Duration::from_millis(500),
            event_history_limit: 1000,
            session_id_attempts: 5,
        }
    }
}

impl RelayConfig {
    pub fn session_ttl_ms(&self) -> i64 {
        millis(self.session_ttl)
    }

    pub fn message_ttl_ms(&self) -> i64 {
        millis(self.message_ttl)
    }

    pub fn pc_stale_after_ms(&self) -> i64 {
        millis(self.pc_stale_after)
    }

    /// 规整 poll 的 limit：缺省取默认值，落在 [1, poll_max_batch] 内
    pub fn clamp_batch(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.poll_default_batch)
            .clamp(1, self.poll_max_batch.max(1))
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
