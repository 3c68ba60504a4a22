use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::device::DeviceCandidate;

const CHARSET: &[u8] = b"0123456789";
pub const CODE_LENGTH: usize = 9;

/// 配对码状态
///
/// `Pending → Consumed` 只发生一次；`Pending → Expired` 在兑换时惰性发生。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CodeState {
    Pending,
    Consumed,
    Expired,
}

/// 设备端生成的配对码
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub code: String,
    pub device: DeviceCandidate,
    pub created_at: i64,
    pub expires_at: i64,
    pub state: CodeState,
    /// 兑换成功的账号
    pub consumed_by: Option<String>,
}

impl PairingCode {
    pub fn new(code: String, device: DeviceCandidate, now_millis: i64, ttl_millis: i64) -> Self {
        Self {
            code,
            device,
            created_at: now_millis,
            expires_at: now_millis.saturating_add(ttl_millis),
            state: CodeState::Pending,
            consumed_by: None,
        }
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at
    }

    /// 兑换时看到的状态：已过期但尚未标记的待兑换码视为 `Expired`
    pub fn effective_state(&self, now_millis: i64) -> CodeState {
        match self.state {
            CodeState::Pending if self.is_expired(now_millis) => CodeState::Expired,
            state => state,
        }
    }
}

/// 随机生成 9 位数字
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .filter_map(|_| CHARSET.choose(&mut rng).map(|&b| b as char))
        .collect()
}

/// 必须正好 9 位 ASCII 数字
pub fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit())
}

/// 日志中只保留后 3 位
pub fn mask(code: &str) -> String {
    let tail: String = code
        .chars()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("******{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_well_formed() {
        for _ in 0..100 {
            let code = generate_code();
            assert!(is_well_formed(&code), "bad code {code}");
        }
    }

    #[test]
    fn format_check() {
        assert!(is_well_formed("123456789"));
        assert!(!is_well_formed("12345678"));
        assert!(!is_well_formed("1234567890"));
        assert!(!is_well_formed("12345678a"));
        assert!(!is_well_formed("１２３４５６７８９"));
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let code = PairingCode::new(
            "123456789".into(),
            DeviceCandidate::new("tv-1", "Lobby"),
            0,
            300_000,
        );
        assert_eq!(code.expires_at, 300_000);
        assert!(!code.is_expired(300_000));
        assert!(code.is_expired(300_001));
        assert_eq!(code.effective_state(299_999), CodeState::Pending);
        assert_eq!(code.effective_state(301_000), CodeState::Expired);
    }

    #[test]
    fn mask_keeps_tail() {
        assert_eq!(mask("123456789"), "******789");
        assert_eq!(mask("12"), "******12");
    }
}
