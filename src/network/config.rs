use std::time::Duration;

/// 配对码有效期：5 分钟
pub const CODE_TTL: Duration = Duration::from_secs(300);
/// 兑换请求的最长等待时间
pub const BOUND_WAIT: Duration = Duration::from_secs(30);
/// 输满 9 位后自动提交前的延迟，让用户看清输入
const SUBMIT_DEBOUNCE: Duration = Duration::from_millis(300);
/// 配对成功提示的展示时长
const SUCCESS_DISPLAY: Duration = Duration::from_secs(3);
/// 过期配对码的定期清理间隔
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// 配对与在线状态的运行参数
///
/// `code_ttl` 和 `bound_wait` 会展示给用户（见 [`PairingConfig::hint`]），
/// 修改时注意同步界面文案。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfig {
    pub code_ttl: Duration,
    /// 已消耗/已过期的配对码在 `expires_at` 之后继续保留的时长，
    /// 保留期内重复兑换返回 `ALREADY_CONSUMED`/`EXPIRED` 而不是 `NOT_FOUND`
    pub tombstone_retention: Duration,
    pub sweep_interval: Duration,
    pub bound_wait: Duration,
    pub submit_debounce: Duration,
    pub success_display: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_ttl: CODE_TTL,
            tombstone_retention: CODE_TTL,
            sweep_interval: SWEEP_INTERVAL,
            bound_wait: BOUND_WAIT,
            submit_debounce: SUBMIT_DEBOUNCE,
            success_display: SUCCESS_DISPLAY,
        }
    }
}

impl PairingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.code_ttl = ttl;
        self
    }

    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_bound_wait(mut self, wait: Duration) -> Self {
        self.bound_wait = wait;
        self
    }

    pub fn with_submit_debounce(mut self, debounce: Duration) -> Self {
        self.submit_debounce = debounce;
        self
    }

    pub fn with_success_display(mut self, display: Duration) -> Self {
        self.success_display = display;
        self
    }

    /// 配对页面展示的时限说明
    pub fn hint(&self) -> String {
        format!(
            "配对码在 {} 内有效，提交后最多等待 {}",
            human_duration(self.code_ttl),
            human_duration(self.bound_wait)
        )
    }
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{} 分钟", secs / 60)
    } else {
        format!("{} 秒", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_constants() {
        let config = PairingConfig::default();
        assert_eq!(config.code_ttl, Duration::from_secs(300));
        assert_eq!(config.bound_wait, Duration::from_secs(30));
        assert_eq!(config.success_display, Duration::from_secs(3));
    }

    #[test]
    fn hint_mentions_both_limits() {
        let config = PairingConfig::new().with_bound_wait(Duration::from_secs(45));
        assert_eq!(config.hint(), "配对码在 5 分钟 内有效，提交后最多等待 45 秒");
    }
}
