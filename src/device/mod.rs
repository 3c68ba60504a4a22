//! 设备模块
//!
//! 设备、播放列表关联等数据模型，以及持久化设备库的窄接口
//! [`DeviceRegistry`]。配对成功时创建设备，状态/心跳事件和播放列表分配时更新，
//! 所有者解除关联时删除。

pub mod registry;
mod utils;

pub use registry::{DeviceRegistry, Dissociation, InMemoryRegistry};
pub use utils::LastSeenLabel;

use serde::{Deserialize, Serialize};

/// 设备状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Playing,
    Paused,
    Error,
}

impl DeviceStatus {
    /// 设备是否在线（含播放/暂停）
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Online | Self::Playing | Self::Paused)
    }
}

/// 屏幕方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

/// 分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// 播放列表（由外部内容服务维护，这里只读）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
}

/// 设备与播放列表的关联
///
/// `priority` 越小优先级越高，决定展示顺序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistAssociation {
    pub id: String,
    pub is_active: bool,
    pub priority: i32,
    pub playlist: Playlist,
}

/// 设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub location_label: Option<String>,
    pub resolution: Resolution,
    pub orientation: Orientation,
    pub status: DeviceStatus,
    /// Unix 毫秒时间戳
    pub last_seen_at: i64,
    pub associations: Vec<PlaylistAssociation>,
}

impl Device {
    /// 当前正在播放的关联
    pub fn active_association(&self) -> Option<&PlaylistAssociation> {
        self.associations.iter().find(|a| a.is_active)
    }

    /// 按优先级排序的关联
    pub fn associations_by_priority(&self) -> Vec<&PlaylistAssociation> {
        let mut sorted: Vec<_> = self.associations.iter().collect();
        sorted.sort_by_key(|a| a.priority);
        sorted
    }

    pub fn last_seen_label(&self, now_millis: i64) -> LastSeenLabel {
        LastSeenLabel::from_millis(now_millis, self.last_seen_at)
    }
}

/// 设备端生成配对码时附带的设备信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCandidate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location_label: Option<String>,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub orientation: Orientation,
}

impl DeviceCandidate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            location_label: None,
            resolution: Resolution::default(),
            orientation: Orientation::default(),
        }
    }

    pub fn with_location(mut self, label: impl Into<String>) -> Self {
        self.location_label = Some(label.into());
        self
    }
}

/// 加入设备房间时返回的当前状态
///
/// `seq` 是快照时刻频道已发布的事件序号，之后推送的事件序号都大于它。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_seen_at: i64,
    pub associations: Vec<PlaylistAssociation>,
    pub seq: u64,
}

impl DeviceSnapshot {
    pub fn from_device(device: &Device, seq: u64) -> Self {
        Self {
            device_id: device.id.clone(),
            status: device.status,
            last_seen_at: device.last_seen_at,
            associations: device.associations.clone(),
            seq,
        }
    }
}

/// 设备过滤器
#[derive(Debug, Clone, Copy, serde::Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DeviceFilter {
    #[default]
    All,
    /// 在线、播放中或暂停
    Active,
    /// 离线或故障
    Offline,
}

impl DeviceFilter {
    pub fn matches(self, device: &Device) -> bool {
        match self {
            Self::All => true,
            Self::Active => device.status.is_reachable(),
            Self::Offline => !device.status.is_reachable(),
        }
    }
}

/// 设备列表查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListResult {
    pub devices: Vec<Device>,
    pub total: usize,
}

impl From<Vec<Device>> for DeviceListResult {
    fn from(devices: Vec<Device>) -> Self {
        let total = devices.len();
        Self { devices, total }
    }
}
