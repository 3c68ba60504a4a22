use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::code::{self, CodeState, PairingCode};
use crate::clock::{duration_millis, ClockSource};
use crate::device::{DeviceCandidate, DeviceRegistry};
use crate::network::config::PairingConfig;
use crate::presence::PresenceHub;
use crate::protocol::{RedeemFailure, RedeemOutcome};
use crate::{AppError, AppResult};

/// 生成随机配对码时的最大重试次数
const MAX_GENERATE_ATTEMPTS: usize = 16;

/// 配对码管理器
///
/// 保证每个配对码最多被一个账号兑换一次。兑换时在 DashMap 分片写锁内
/// 完成 "读状态 → 判定 → 写 Consumed"，同一配对码的并发兑换只有一个成功。
pub struct PairingSessionManager {
    registry: Arc<dyn DeviceRegistry>,
    presence: Arc<PresenceHub>,
    clock: Arc<dyn ClockSource>,
    config: PairingConfig,
    /// 活跃的配对码（含保留期内的已消耗/已过期记录），key 为配对码字符串
    codes: DashMap<String, PairingCode>,
}

impl PairingSessionManager {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        presence: Arc<PresenceHub>,
        clock: Arc<dyn ClockSource>,
        config: PairingConfig,
    ) -> Self {
        Self {
            registry,
            presence,
            clock,
            config,
            codes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// 设备端：生成新的配对码
    pub fn issue_code(&self, device: DeviceCandidate) -> AppResult<PairingCode> {
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            match self.register_code(&code::generate_code(), device.clone()) {
                Err(AppError::CodeInUse) => continue,
                other => return other,
            }
        }
        Err(AppError::CodeInUse)
    }

    /// 设备端：登记指定的配对码
    ///
    /// 保留期内的旧记录（含已消耗、已过期）一律视为占用，清理后才能再次登记。
    pub fn register_code(&self, code: &str, device: DeviceCandidate) -> AppResult<PairingCode> {
        if !code::is_well_formed(code) {
            return Err(AppError::InvalidCode);
        }

        let now = self.clock.now_millis();
        let record = PairingCode::new(
            code.to_string(),
            device,
            now,
            duration_millis(self.config.code_ttl),
        );

        match self.codes.entry(code.to_string()) {
            Entry::Occupied(_) => return Err(AppError::CodeInUse),
            Entry::Vacant(entry) => {
                entry.insert(record.clone());
            }
        }

        info!(
            "Pairing code {} issued for device {}",
            code::mask(code),
            record.device.id
        );
        Ok(record)
    }

    /// 兑换配对码
    ///
    /// 所有失败原因对该配对码都是终态，这里不做任何重试。
    /// 返回 `Err` 仅表示设备库写入失败，此时配对码恢复为待兑换状态。
    /// 写入进行中配对码已标记为消耗，并发的兑换会得到 `AlreadyConsumed`，
    /// 即使这次写入最终失败。
    pub fn redeem(&self, code: &str, user_id: &str) -> AppResult<RedeemOutcome> {
        if !code::is_well_formed(code) {
            debug!("Rejecting malformed pairing code from {}", user_id);
            return Ok(RedeemOutcome::failure(RedeemFailure::Malformed));
        }

        // 在分片写锁内完成检查与消耗，锁在块结束时释放
        let device = {
            let Some(mut entry) = self.codes.get_mut(code) else {
                info!("Pairing code {} not found", code::mask(code));
                return Ok(RedeemOutcome::failure(RedeemFailure::NotFound));
            };

            let now = self.clock.now_millis();
            match entry.effective_state(now) {
                CodeState::Consumed => {
                    info!(
                        "Pairing code {} already consumed, rejecting {}",
                        code::mask(code),
                        user_id
                    );
                    return Ok(RedeemOutcome::failure(RedeemFailure::AlreadyConsumed));
                }
                CodeState::Expired => {
                    entry.state = CodeState::Expired;
                    info!("Pairing code {} expired", code::mask(code));
                    return Ok(RedeemOutcome::failure(RedeemFailure::Expired));
                }
                CodeState::Pending => {
                    entry.state = CodeState::Consumed;
                    entry.consumed_by = Some(user_id.to_string());
                    entry.device.clone()
                }
            }
        };

        let now = self.clock.now_millis();
        match self.registry.upsert_paired(&device, user_id, now) {
            Ok(paired) => {
                self.presence.open(&paired.id);
                info!(
                    "Pairing code {} redeemed by {}: device {}",
                    code::mask(code),
                    user_id,
                    paired.id
                );
                Ok(RedeemOutcome::Success {
                    device_id: paired.id,
                    device_name: paired.name,
                })
            }
            Err(e) => {
                warn!("Failed to persist pairing for {}: {}", device.id, e);
                if let Some(mut entry) = self.codes.get_mut(code) {
                    if entry.consumed_by.as_deref() == Some(user_id) {
                        entry.state = CodeState::Pending;
                        entry.consumed_by = None;
                    }
                }
                Err(e)
            }
        }
    }

    /// 查询配对码记录，状态按当前时间折算
    pub fn lookup(&self, code: &str) -> Option<PairingCode> {
        let now = self.clock.now_millis();
        self.codes.get(code).map(|entry| {
            let mut record = entry.clone();
            record.state = record.effective_state(now);
            record
        })
    }

    /// 待兑换且未过期的配对码数量
    pub fn pending_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.codes
            .iter()
            .filter(|e| e.effective_state(now) == CodeState::Pending)
            .count()
    }

    /// 清理超过 `expires_at + tombstone_retention` 的记录，返回清理数量
    pub fn sweep_expired(&self) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_millis(self.config.tombstone_retention));
        let before = self.codes.len();
        self.codes.retain(|_, record| record.expires_at >= cutoff);
        let swept = before.saturating_sub(self.codes.len());
        if swept > 0 {
            debug!("Swept {} pairing codes", swept);
        }
        swept
    }

    /// 启动定期清理任务，取消令牌触发后退出
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Pairing code sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_expired();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::{
        Device, DeviceStatus, Dissociation, InMemoryRegistry, PlaylistAssociation,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<InMemoryRegistry>,
        presence: Arc<PresenceHub>,
        manager: Arc<PairingSessionManager>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(T0));
        let registry = Arc::new(InMemoryRegistry::new());
        let presence = Arc::new(PresenceHub::new(registry.clone()));
        let manager = Arc::new(PairingSessionManager::new(
            registry.clone(),
            presence.clone(),
            clock.clone(),
            PairingConfig::default(),
        ));
        Fixture {
            clock,
            registry,
            presence,
            manager,
        }
    }

    fn tv42() -> DeviceCandidate {
        DeviceCandidate::new("tv-42", "Lobby TV")
    }

    type WriteHook = Box<dyn FnOnce() + Send>;

    /// 下一次 `upsert_paired` 失败的设备库，失败前先执行 `during_write`
    #[derive(Default)]
    struct FailingRegistry {
        inner: InMemoryRegistry,
        fail_next: AtomicBool,
        during_write: Mutex<Option<WriteHook>>,
    }

    impl DeviceRegistry for FailingRegistry {
        fn get(&self, device_id: &str) -> Option<Device> {
            self.inner.get(device_id)
        }

        fn list_by_owner(&self, owner: &str) -> Vec<Device> {
            self.inner.list_by_owner(owner)
        }

        fn is_owner(&self, device_id: &str, owner: &str) -> bool {
            self.inner.is_owner(device_id, owner)
        }

        fn has_owner(&self, device_id: &str) -> bool {
            self.inner.has_owner(device_id)
        }

        fn upsert_paired(
            &self,
            candidate: &DeviceCandidate,
            owner: &str,
            now_millis: i64,
        ) -> AppResult<Device> {
            let hook = self.during_write.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(AppError::ConnectionClosed);
            }
            self.inner.upsert_paired(candidate, owner, now_millis)
        }

        fn set_status(&self, device_id: &str, status: DeviceStatus) -> AppResult<Device> {
            self.inner.set_status(device_id, status)
        }

        fn touch(&self, device_id: &str, at_millis: i64) -> AppResult<Device> {
            self.inner.touch(device_id, at_millis)
        }

        fn set_associations(
            &self,
            device_id: &str,
            associations: Vec<PlaylistAssociation>,
        ) -> AppResult<Device> {
            self.inner.set_associations(device_id, associations)
        }

        fn dissociate(&self, device_id: &str, owner: &str) -> AppResult<Dissociation> {
            self.inner.dissociate(device_id, owner)
        }
    }

    #[test]
    fn failed_registry_write_returns_code_to_pending() {
        let clock = Arc::new(ManualClock::new(T0));
        let registry = Arc::new(FailingRegistry::default());
        let presence = Arc::new(PresenceHub::new(registry.clone()));
        let manager = Arc::new(PairingSessionManager::new(
            registry.clone(),
            presence.clone(),
            clock,
            PairingConfig::default(),
        ));
        manager.register_code("123456789", tv42()).unwrap();

        // 写入期间的并发兑换看到的是已消耗
        let concurrent = Arc::new(Mutex::new(None));
        registry.fail_next.store(true, Ordering::SeqCst);
        *registry.during_write.lock().unwrap() = Some(Box::new({
            let manager = manager.clone();
            let concurrent = concurrent.clone();
            move || {
                let outcome = manager.redeem("123456789", "U2").unwrap();
                *concurrent.lock().unwrap() = Some(outcome);
            }
        }));

        let err = manager.redeem("123456789", "U1").unwrap_err();
        assert!(matches!(err, AppError::ConnectionClosed));
        assert_eq!(
            concurrent.lock().unwrap().take(),
            Some(RedeemOutcome::failure(RedeemFailure::AlreadyConsumed))
        );

        let record = manager.lookup("123456789").unwrap();
        assert_eq!(record.state, CodeState::Pending);
        assert_eq!(record.consumed_by, None);
        assert!(registry.get("tv-42").is_none());
        assert!(!presence.has_channel("tv-42"));

        assert!(manager.redeem("123456789", "U1").unwrap().is_success());
        assert!(registry.is_owner("tv-42", "U1"));
    }

    #[test]
    fn second_redeemer_sees_already_consumed() {
        let f = fixture();
        f.manager.register_code("123456789", tv42()).unwrap();

        f.clock.advance(Duration::from_secs(10));
        let first = f.manager.redeem("123456789", "U1").unwrap();
        assert_eq!(
            first,
            RedeemOutcome::Success {
                device_id: "tv-42".into(),
                device_name: "Lobby TV".into(),
            }
        );

        f.clock.advance(Duration::from_secs(2));
        let second = f.manager.redeem("123456789", "U2").unwrap();
        assert_eq!(second, RedeemOutcome::failure(RedeemFailure::AlreadyConsumed));

        assert!(f.registry.is_owner("tv-42", "U1"));
        assert!(!f.registry.is_owner("tv-42", "U2"));
        assert!(f.presence.has_channel("tv-42"));
    }

    #[test]
    fn redeem_after_ttl_is_expired() {
        let f = fixture();
        f.manager.register_code("123456789", tv42()).unwrap();

        f.clock.advance(Duration::from_secs(301));
        let outcome = f.manager.redeem("123456789", "U1").unwrap();
        assert_eq!(outcome, RedeemOutcome::failure(RedeemFailure::Expired));
        assert!(f.registry.get("tv-42").is_none());

        // 终态：再次兑换仍是 Expired
        let again = f.manager.redeem("123456789", "U1").unwrap();
        assert_eq!(again, RedeemOutcome::failure(RedeemFailure::Expired));
    }

    #[test]
    fn redeem_at_exact_deadline_still_succeeds() {
        let f = fixture();
        f.manager.register_code("123456789", tv42()).unwrap();
        f.clock.advance(Duration::from_secs(300));
        assert!(f.manager.redeem("123456789", "U1").unwrap().is_success());
    }

    #[test]
    fn unknown_and_malformed_codes() {
        let f = fixture();
        assert_eq!(
            f.manager.redeem("999999999", "U1").unwrap(),
            RedeemOutcome::failure(RedeemFailure::NotFound)
        );
        assert_eq!(
            f.manager.redeem("12345", "U1").unwrap(),
            RedeemOutcome::failure(RedeemFailure::Malformed)
        );
        assert!(matches!(
            f.manager.register_code("abc", tv42()),
            Err(AppError::InvalidCode)
        ));
    }

    #[test]
    fn register_rejects_duplicate_until_swept() {
        let f = fixture();
        f.manager.register_code("123456789", tv42()).unwrap();
        assert!(matches!(
            f.manager
                .register_code("123456789", DeviceCandidate::new("tv-1", "Other")),
            Err(AppError::CodeInUse)
        ));

        // 过期但仍在保留期内
        f.clock.advance(Duration::from_secs(301));
        assert!(matches!(
            f.manager
                .register_code("123456789", DeviceCandidate::new("tv-1", "Other")),
            Err(AppError::CodeInUse)
        ));

        f.clock.advance(Duration::from_secs(300));
        assert_eq!(f.manager.sweep_expired(), 1);
        let reissued = f
            .manager
            .register_code("123456789", DeviceCandidate::new("tv-1", "Other"))
            .unwrap();
        assert_eq!(reissued.state, CodeState::Pending);
        assert_eq!(reissued.device.id, "tv-1");
    }

    #[test]
    fn issue_code_generates_pending_code() {
        let f = fixture();
        let issued = f.manager.issue_code(tv42()).unwrap();
        assert!(code::is_well_formed(&issued.code));
        assert_eq!(issued.expires_at - issued.created_at, 300_000);
        assert_eq!(f.manager.pending_count(), 1);
        assert_eq!(
            f.manager.lookup(&issued.code).map(|c| c.state),
            Some(CodeState::Pending)
        );
    }

    #[test]
    fn lookup_reports_lazy_expiry() {
        let f = fixture();
        f.manager.register_code("123456789", tv42()).unwrap();
        f.clock.advance(Duration::from_secs(301));
        assert_eq!(
            f.manager.lookup("123456789").map(|c| c.state),
            Some(CodeState::Expired)
        );
        assert_eq!(f.manager.pending_count(), 0);
    }

    #[test]
    fn sweep_keeps_tombstones_through_retention() {
        let f = fixture();
        f.manager.register_code("123456789", tv42()).unwrap();
        f.manager.redeem("123456789", "U1").unwrap();

        // expires_at + 4 分钟：仍在保留期内
        f.clock.advance(Duration::from_secs(300 + 240));
        assert_eq!(f.manager.sweep_expired(), 0);
        assert_eq!(
            f.manager.redeem("123456789", "U2").unwrap(),
            RedeemOutcome::failure(RedeemFailure::AlreadyConsumed)
        );

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.manager.sweep_expired(), 1);
        assert_eq!(
            f.manager.redeem("123456789", "U2").unwrap(),
            RedeemOutcome::failure(RedeemFailure::NotFound)
        );
    }

    #[test]
    fn concurrent_redeemers_have_exactly_one_winner() {
        let f = fixture();
        f.manager.register_code("555555555", tv42()).unwrap();

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let manager = f.manager.clone();
                std::thread::spawn(move || manager.redeem("555555555", &format!("user-{i}")))
            })
            .collect();

        let outcomes: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let winners = outcomes.iter().filter(|o| o.is_success()).count();
        assert_eq!(winners, 1);
        assert!(outcomes
            .iter()
            .filter(|o| !o.is_success())
            .all(|o| *o == RedeemOutcome::failure(RedeemFailure::AlreadyConsumed)));
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_cancelled() {
        let f = fixture();
        f.manager.register_code("123456789", tv42()).unwrap();
        f.clock.advance(Duration::from_secs(3_600));

        let cancel = CancellationToken::new();
        let handle = f
            .manager
            .clone()
            .spawn_sweeper(Duration::from_secs(60), cancel.clone());

        // 首次 tick 立即触发
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.manager.lookup("123456789").is_none());

        cancel.cancel();
        handle.await.unwrap();
    }
}
