use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::api::DeviceApi;
use crate::device::{Device, DeviceFilter, DeviceSnapshot};
use crate::network::TransportClient;
use crate::protocol::{PresenceDelivery, PresenceEvent};
use crate::AppResult;

/// 设备列表页面的客户端状态
///
/// 挂载时拉取设备列表并加入每个设备的房间（以快照为准），之后用推送增量更新；
/// 解除关联或卸载时离开房间。推送按 `seq` 去重，不早于快照的事件被丢弃。
pub struct DeviceWatcher<A> {
    api: A,
    transport: Arc<TransportClient>,
    devices: Vec<Device>,
    /// 每个设备已应用的最大序号
    applied: HashMap<String, u64>,
}

impl<A: DeviceApi> DeviceWatcher<A> {
    pub fn new(api: A, transport: Arc<TransportClient>) -> Self {
        Self {
            api,
            transport,
            devices: Vec::new(),
            applied: HashMap::new(),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn filtered(&self, filter: DeviceFilter) -> Vec<&Device> {
        self.devices.iter().filter(|d| filter.matches(d)).collect()
    }

    pub fn is_watching(&self, device_id: &str) -> bool {
        self.applied.contains_key(device_id)
    }

    /// 页面挂载：拉取列表并加入所有设备房间
    pub async fn mount(&mut self) -> AppResult<()> {
        let listed = self.api.list_devices().await?;
        self.devices.clear();
        self.applied.clear();
        for device in listed.devices {
            self.watch(device).await?;
        }
        info!("Watching {} devices", self.devices.len());
        Ok(())
    }

    /// 重新拉取列表：加入新设备房间，离开已不在列表中的设备房间
    ///
    /// 单个房间离开失败只记录日志，不影响其余设备。
    pub async fn refresh(&mut self) -> AppResult<()> {
        let listed = self.api.list_devices().await?;

        let stale: Vec<String> = self
            .devices
            .iter()
            .filter(|d| !listed.devices.iter().any(|l| l.id == d.id))
            .map(|d| d.id.clone())
            .collect();
        for device_id in stale {
            if let Err(e) = self.transport.leave_room(&device_id).await {
                warn!("Leave room for stale {} failed: {}", device_id, e);
            }
            self.forget(&device_id);
        }

        for device in listed.devices {
            if !self.is_watching(&device.id) {
                self.watch(device).await?;
            }
        }
        Ok(())
    }

    /// 应用一条推送，返回是否改变了本地状态
    pub fn apply(&mut self, delivery: PresenceDelivery) -> bool {
        let Some(&applied) = self.applied.get(&delivery.device_id) else {
            debug!("Ignoring presence for unwatched {}", delivery.device_id);
            return false;
        };
        if delivery.seq <= applied {
            debug!(
                "Dropping stale presence {} for {}",
                delivery.seq, delivery.device_id
            );
            return false;
        }

        if delivery.event == PresenceEvent::DeviceRemoved {
            info!("Device {} removed", delivery.device_id);
            self.forget(&delivery.device_id);
            return true;
        }

        self.applied.insert(delivery.device_id.clone(), delivery.seq);
        let Some(device) = self.devices.iter_mut().find(|d| d.id == delivery.device_id) else {
            return false;
        };
        match delivery.event {
            PresenceEvent::StatusChanged { status } => device.status = status,
            PresenceEvent::LastSeen { last_seen_at } => {
                device.last_seen_at = device.last_seen_at.max(last_seen_at)
            }
            PresenceEvent::AssociationsChanged { associations } => {
                device.associations = associations
            }
            PresenceEvent::DeviceRemoved => {}
        }
        true
    }

    /// 解除关联并离开设备房间
    pub async fn dissociate(&mut self, device_id: &str) -> AppResult<()> {
        self.api.dissociate(device_id).await?;
        if let Err(e) = self.transport.leave_room(device_id).await {
            warn!("Leave room after dissociating {} failed: {}", device_id, e);
        }
        self.forget(device_id);
        Ok(())
    }

    /// 页面卸载：离开所有设备房间
    pub async fn unmount(&mut self) -> AppResult<()> {
        let watched: Vec<String> = self.applied.keys().cloned().collect();
        for device_id in watched {
            self.transport.leave_room(&device_id).await?;
            self.forget(&device_id);
        }
        self.devices.clear();
        Ok(())
    }

    /// 加入房间并以快照覆盖列表中的状态
    ///
    /// 列出之后被解除关联的设备会加入失败，直接跳过。
    async fn watch(&mut self, mut device: Device) -> AppResult<()> {
        let snapshot = match self.transport.join_room(&device.id).await {
            Ok(snapshot) => snapshot,
            Err(e) if matches!(e.kind(), "DeviceNotFound" | "NotOwner") => {
                debug!("Skipping {}: {}", device.id, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        apply_snapshot(&mut device, &snapshot);
        self.applied.insert(device.id.clone(), snapshot.seq);
        self.devices.push(device);
        Ok(())
    }

    fn forget(&mut self, device_id: &str) {
        self.applied.remove(device_id);
        self.devices.retain(|d| d.id != device_id);
    }
}

fn apply_snapshot(device: &mut Device, snapshot: &DeviceSnapshot) {
    device.status = snapshot.status;
    device.last_seen_at = snapshot.last_seen_at;
    device.associations = snapshot.associations.clone();
}
