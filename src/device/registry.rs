use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{Device, DeviceCandidate, DeviceStatus, PlaylistAssociation};
use crate::{AppError, AppResult};

/// 解除关联的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dissociation {
    pub device_id: String,
    /// 仍关联该设备的账号数
    pub remaining_owners: usize,
    /// 没有任何账号关联时设备记录被删除
    pub removed: bool,
}

/// 设备库的窄接口
///
/// 设备库是状态的权威来源，加入设备房间时以它为快照。
/// 每个方法对单个设备的读-改-写是原子的。
pub trait DeviceRegistry: Send + Sync {
    fn get(&self, device_id: &str) -> Option<Device>;

    /// 按名称排序
    fn list_by_owner(&self, owner: &str) -> Vec<Device>;

    fn is_owner(&self, device_id: &str, owner: &str) -> bool;

    /// 设备是否至少关联一个账号
    fn has_owner(&self, device_id: &str) -> bool;

    /// 配对成功：创建或更新设备，并把 `owner` 加入关联账号
    fn upsert_paired(
        &self,
        candidate: &DeviceCandidate,
        owner: &str,
        now_millis: i64,
    ) -> AppResult<Device>;

    fn set_status(&self, device_id: &str, status: DeviceStatus) -> AppResult<Device>;

    /// 更新 `last_seen_at`，时间戳只会前进
    fn touch(&self, device_id: &str, at_millis: i64) -> AppResult<Device>;

    /// 替换播放列表关联，最多只能有一个激活
    fn set_associations(
        &self,
        device_id: &str,
        associations: Vec<PlaylistAssociation>,
    ) -> AppResult<Device>;

    fn dissociate(&self, device_id: &str, owner: &str) -> AppResult<Dissociation>;
}

/// 设备记录（DashMap 中的值）
#[derive(Debug, Clone)]
struct DeviceRecord {
    device: Device,
    owners: HashSet<String>,
}

/// 内存设备库
///
/// 本身不含 Arc，需要共享时由使用方包裹 `Arc<InMemoryRegistry>`。
#[derive(Default)]
pub struct InMemoryRegistry {
    devices: DashMap<String, DeviceRecord>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设备总数
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn update<F>(&self, device_id: &str, f: F) -> AppResult<Device>
    where
        F: FnOnce(&mut Device) -> AppResult<()>,
    {
        let mut entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| AppError::DeviceNotFound(device_id.to_string()))?;
        f(&mut entry.device)?;
        Ok(entry.device.clone())
    }
}

impl DeviceRegistry for InMemoryRegistry {
    fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|e| e.device.clone())
    }

    fn list_by_owner(&self, owner: &str) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|e| e.value().owners.contains(owner))
            .map(|e| e.value().device.clone())
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    fn is_owner(&self, device_id: &str, owner: &str) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|e| e.owners.contains(owner))
    }

    fn has_owner(&self, device_id: &str) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|e| !e.owners.is_empty())
    }

    fn upsert_paired(
        &self,
        candidate: &DeviceCandidate,
        owner: &str,
        now_millis: i64,
    ) -> AppResult<Device> {
        match self.devices.entry(candidate.id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.device.name = candidate.name.clone();
                record.device.location_label = candidate.location_label.clone();
                record.device.resolution = candidate.resolution;
                record.device.orientation = candidate.orientation;
                record.device.last_seen_at = record.device.last_seen_at.max(now_millis);
                record.owners.insert(owner.to_string());
                debug!("Device {} re-paired, {} owners", candidate.id, record.owners.len());
                Ok(record.device.clone())
            }
            Entry::Vacant(entry) => {
                let device = Device {
                    id: candidate.id.clone(),
                    name: candidate.name.clone(),
                    location_label: candidate.location_label.clone(),
                    resolution: candidate.resolution,
                    orientation: candidate.orientation,
                    status: DeviceStatus::Online,
                    last_seen_at: now_millis,
                    associations: Vec::new(),
                };
                entry.insert(DeviceRecord {
                    device: device.clone(),
                    owners: HashSet::from([owner.to_string()]),
                });
                info!("Device {} created for owner {}", candidate.id, owner);
                Ok(device)
            }
        }
    }

    fn set_status(&self, device_id: &str, status: DeviceStatus) -> AppResult<Device> {
        self.update(device_id, |device| {
            device.status = status;
            Ok(())
        })
    }

    fn touch(&self, device_id: &str, at_millis: i64) -> AppResult<Device> {
        self.update(device_id, |device| {
            device.last_seen_at = device.last_seen_at.max(at_millis);
            Ok(())
        })
    }

    fn set_associations(
        &self,
        device_id: &str,
        associations: Vec<PlaylistAssociation>,
    ) -> AppResult<Device> {
        validate_associations(&associations)?;
        self.update(device_id, |device| {
            device.associations = associations;
            Ok(())
        })
    }

    fn dissociate(&self, device_id: &str, owner: &str) -> AppResult<Dissociation> {
        match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().owners.remove(owner) {
                    return Err(AppError::NotOwner {
                        device_id: device_id.to_string(),
                    });
                }

                let remaining_owners = entry.get().owners.len();
                let removed = remaining_owners == 0;
                if removed {
                    entry.remove();
                }
                info!(
                    "Device {} dissociated from {}, remaining owners: {}",
                    device_id, owner, remaining_owners
                );

                Ok(Dissociation {
                    device_id: device_id.to_string(),
                    remaining_owners,
                    removed,
                })
            }
            Entry::Vacant(_) => Err(AppError::DeviceNotFound(device_id.to_string())),
        }
    }
}

/// 关联 id 唯一，且最多一个 `is_active`
fn validate_associations(associations: &[PlaylistAssociation]) -> AppResult<()> {
    let active = associations.iter().filter(|a| a.is_active).count();
    if active > 1 {
        return Err(AppError::InvalidAssociations(format!(
            "{active} associations are active, at most one allowed"
        )));
    }

    let mut seen = HashSet::with_capacity(associations.len());
    for association in associations {
        if !seen.insert(association.id.as_str()) {
            return Err(AppError::InvalidAssociations(format!(
                "duplicate association id {}",
                association.id
            )));
        }
    }
    Ok(())
}
