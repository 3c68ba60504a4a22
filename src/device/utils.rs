use std::fmt;

use chrono::{DateTime, NaiveDate};

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// "最后在线" 的相对时间分档
///
/// 分档边界:
/// 1. < 1 分钟 → 刚刚
/// 2. < 60 分钟 → N 分钟前
/// 3. < 24 小时 → N 小时前
/// 4. < 7 天 → N 天前
/// 5. 其余 → 日历日期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeenLabel {
    JustNow,
    Minutes(i64),
    Hours(i64),
    Days(i64),
    Date(NaiveDate),
}

impl LastSeenLabel {
    /// 未来时间戳（时钟偏差）视为刚刚
    pub fn from_millis(now: i64, last_seen: i64) -> Self {
        let elapsed = now.saturating_sub(last_seen);
        if elapsed < MINUTE_MS {
            Self::JustNow
        } else if elapsed < HOUR_MS {
            Self::Minutes(elapsed / MINUTE_MS)
        } else if elapsed < DAY_MS {
            Self::Hours(elapsed / HOUR_MS)
        } else if elapsed < 7 * DAY_MS {
            Self::Days(elapsed / DAY_MS)
        } else {
            let date = DateTime::from_timestamp_millis(last_seen)
                .map(|dt| dt.date_naive())
                .unwrap_or(NaiveDate::MIN);
            Self::Date(date)
        }
    }
}

impl fmt::Display for LastSeenLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JustNow => write!(f, "just now"),
            Self::Minutes(n) => write!(f, "{n} min ago"),
            Self::Hours(n) => write!(f, "{n} h ago"),
            Self::Days(n) => write!(f, "{n} d ago"),
            Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}
