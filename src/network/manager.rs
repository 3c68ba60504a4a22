use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::PairingConfig;
use crate::clock::{ClockSource, SystemClock};
use crate::device::{
    Device, DeviceFilter, DeviceListResult, DeviceRegistry, DeviceStatus, Dissociation,
    InMemoryRegistry, PlaylistAssociation,
};
use crate::pairing::PairingSessionManager;
use crate::presence::PresenceHub;
use crate::protocol::PresenceEvent;
use crate::AppResult;

/// 服务端协调器
///
/// 统一持有 [`DeviceRegistry`]、[`PresenceHub`] 和 [`PairingSessionManager`]，
/// 设备状态的写入都经过这里：在设备频道锁内先写设备库，再发布事件。
pub struct Coordinator {
    registry: Arc<dyn DeviceRegistry>,
    presence: Arc<PresenceHub>,
    pairing: Arc<PairingSessionManager>,
    clock: Arc<dyn ClockSource>,
    config: PairingConfig,
    shutdown: CancellationToken,
}

/// 协调器运行状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub running: bool,
    pub pending_codes: usize,
    pub open_channels: usize,
    pub connected_subscribers: usize,
}

impl Coordinator {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        clock: Arc<dyn ClockSource>,
        config: PairingConfig,
    ) -> Self {
        let presence = Arc::new(PresenceHub::new(registry.clone()));
        let pairing = Arc::new(PairingSessionManager::new(
            registry.clone(),
            presence.clone(),
            clock.clone(),
            config.clone(),
        ));
        Self {
            registry,
            presence,
            pairing,
            clock,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// 内存设备库 + 系统时钟
    pub fn in_memory(config: PairingConfig) -> Self {
        Self::new(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(SystemClock),
            config,
        )
    }

    pub fn pairing(&self) -> &Arc<PairingSessionManager> {
        &self.pairing
    }

    pub fn presence(&self) -> &Arc<PresenceHub> {
        &self.presence
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// 设备上报状态
    pub fn report_status(&self, device_id: &str, status: DeviceStatus) -> AppResult<Device> {
        self.presence.publish_with(
            device_id,
            || self.registry.set_status(device_id, status),
            |_| PresenceEvent::StatusChanged { status },
        )
    }

    /// 设备心跳，`at_millis` 为空时取当前时间
    pub fn heartbeat(&self, device_id: &str, at_millis: Option<i64>) -> AppResult<Device> {
        let at = at_millis.unwrap_or_else(|| self.clock.now_millis());
        self.presence.publish_with(
            device_id,
            || self.registry.touch(device_id, at),
            |device| PresenceEvent::LastSeen {
                last_seen_at: device.last_seen_at,
            },
        )
    }

    /// 替换设备的播放列表关联
    pub fn assign_playlists(
        &self,
        device_id: &str,
        associations: Vec<PlaylistAssociation>,
    ) -> AppResult<Device> {
        self.presence.publish_with(
            device_id,
            || self.registry.set_associations(device_id, associations),
            |device| PresenceEvent::AssociationsChanged {
                associations: device.associations.clone(),
            },
        )
    }

    /// 账号解除与设备的关联
    ///
    /// 仍有其他账号关联时只移出该账号的订阅者；最后一个账号解除后
    /// 设备记录被删除，频道内所有订阅者收到 `DeviceRemoved` 后被移出。
    pub fn dissociate(&self, device_id: &str, user_id: &str) -> AppResult<Dissociation> {
        let result = self.registry.dissociate(device_id, user_id)?;
        let owner = if result.removed { None } else { Some(user_id) };
        let evicted = self.presence.evict(device_id, owner);
        info!(
            "Device {} dissociated by {}, {} subscribers evicted",
            device_id, user_id, evicted
        );
        Ok(result)
    }

    /// 账号名下的设备列表
    pub fn devices_for(&self, user_id: &str, filter: DeviceFilter) -> DeviceListResult {
        self.registry
            .list_by_owner(user_id)
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect::<Vec<_>>()
            .into()
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            running: !self.shutdown.is_cancelled(),
            pending_codes: self.pairing.pending_count(),
            open_channels: self.presence.channel_count(),
            connected_subscribers: self.presence.subscriber_count(),
        }
    }

    /// 启动过期配对码清理任务，随 [`shutdown`](Self::shutdown) 退出
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        self.pairing
            .clone()
            .spawn_sweeper(self.config.sweep_interval, self.shutdown.child_token())
    }

    /// 停止后台任务，已建立的连接循环随之退出
    pub fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.shutdown.cancel();
    }

    /// 获取连接循环需要的共享引用
    pub(crate) fn shared_refs(&self) -> SharedRefs {
        SharedRefs {
            presence: self.presence.clone(),
            pairing: self.pairing.clone(),
            shutdown: self.shutdown.child_token(),
        }
    }
}

/// 连接循环使用的共享引用
///
/// 持有与 [`Coordinator`] 相同的 Arc 引用，
/// 供 [`spawn_connection_loop`](super::spawn_connection_loop) 在独立 tokio task 中使用。
#[derive(Clone)]
pub(crate) struct SharedRefs {
    pub presence: Arc<PresenceHub>,
    pub pairing: Arc<PairingSessionManager>,
    pub shutdown: CancellationToken,
}
