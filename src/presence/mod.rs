//! 在线状态模块
//!
//! 每个设备一个频道（房间 `device:{id}`），状态、最后在线时间和播放列表关联的变化
//! 通过频道扇出给所有当前订阅者。核心逻辑在 [`PresenceHub`]。
//!
//! - 同一设备的事件对每个订阅者按发布顺序投递（发布在频道锁内完成）
//! - 加入/离开是幂等的，加入时返回设备当前快照
//! - 频道在订阅者为空且设备不再关联任何账号时回收；
//!   仍有所有者的设备即使没人在看也保留频道

pub mod room;
pub mod watcher;

pub use room::{device_room, parse_device_room};
pub use watcher::DeviceWatcher;

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::{DeviceRegistry, DeviceSnapshot};
use crate::protocol::{PresenceDelivery, PresenceEvent};
use crate::{AppError, AppResult};

pub type SubscriberId = Uuid;

/// 已连接的订阅者（每个客户端连接一个，多路复用所有房间）
struct Subscriber {
    user_id: String,
    tx: mpsc::UnboundedSender<PresenceDelivery>,
}

/// 设备频道，只保存订阅者 id，不持有订阅者状态
#[derive(Debug, Default)]
struct DeviceChannel {
    subscribers: HashSet<SubscriberId>,
    /// 已发布事件数
    seq: u64,
}

/// 订阅句柄，由客户端独占
///
/// 不再观察设备时需调用 [`PresenceHub::leave`]，断开连接时调用
/// [`PresenceHub::disconnect`]。
pub struct Subscription {
    pub id: SubscriberId,
    pub user_id: String,
    receiver: mpsc::UnboundedReceiver<PresenceDelivery>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PresenceDelivery> {
        self.receiver.recv().await
    }

    /// 非阻塞读取已到达的事件
    pub fn try_recv(&mut self) -> Option<PresenceDelivery> {
        self.receiver.try_recv().ok()
    }

    /// 取出所有已到达的事件
    pub fn drain(&mut self) -> Vec<PresenceDelivery> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// 频道管理器
///
/// 两张共享表：设备 → 订阅者集合、订阅者 → 投递通道。
/// 加锁顺序固定为 channels → registry/subscribers，持有 subscribers 时不会再取 channels。
pub struct PresenceHub {
    registry: Arc<dyn DeviceRegistry>,
    channels: DashMap<String, DeviceChannel>,
    subscribers: DashMap<SubscriberId, Subscriber>,
}

impl PresenceHub {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            registry,
            channels: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    /// 注册一个订阅者
    pub fn connect(&self, user_id: &str) -> Subscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.insert(
            id,
            Subscriber {
                user_id: user_id.to_string(),
                tx,
            },
        );
        debug!("Presence subscriber {} connected for {}", id, user_id);
        Subscription {
            id,
            user_id: user_id.to_string(),
            receiver,
        }
    }

    /// 注销订阅者并离开它加入的所有房间
    pub fn disconnect(&self, subscriber_id: SubscriberId) {
        self.subscribers.remove(&subscriber_id);
        for device_id in self.rooms_of(subscriber_id) {
            self.leave(&device_id, subscriber_id);
        }
        debug!("Presence subscriber {} disconnected", subscriber_id);
    }

    /// 打开（或复用）设备频道，配对成功时调用
    pub fn open(&self, device_id: &str) {
        if !self.channels.contains_key(device_id) {
            self.channels.entry(device_id.to_string()).or_default();
            info!("Presence channel opened for {}", device_id);
        }
    }

    /// 加入设备房间，返回设备当前快照
    ///
    /// 所有权检查和快照读取都在频道锁内完成：读取之后发布的事件一定会投递给该订阅者，
    /// 并发的解除关联要么先完成（加入被拒绝），要么在加入之后把它移出。
    pub fn join(&self, device_id: &str, subscriber_id: SubscriberId) -> AppResult<DeviceSnapshot> {
        let user_id = self
            .subscribers
            .get(&subscriber_id)
            .map(|s| s.user_id.clone())
            .ok_or(AppError::SubscriberNotFound)?;

        let result = {
            let mut channel = self.channels.entry(device_id.to_string()).or_default();
            match self.registry.get(device_id) {
                None => Err(AppError::DeviceNotFound(device_id.to_string())),
                Some(_) if !self.registry.is_owner(device_id, &user_id) => Err(AppError::NotOwner {
                    device_id: device_id.to_string(),
                }),
                Some(device) => {
                    if channel.subscribers.insert(subscriber_id) {
                        debug!("Subscriber {} joined {}", subscriber_id, device_id);
                    }
                    Ok(DeviceSnapshot::from_device(&device, channel.seq))
                }
            }
        };

        if result.is_err() {
            self.collect_if_idle(device_id);
        }
        result
    }

    /// 离开设备房间，非成员离开是空操作；返回此前是否为成员
    pub fn leave(&self, device_id: &str, subscriber_id: SubscriberId) -> bool {
        let removed = self
            .channels
            .get_mut(device_id)
            .is_some_and(|mut channel| channel.subscribers.remove(&subscriber_id));

        if removed {
            debug!("Subscriber {} left {}", subscriber_id, device_id);
            self.collect_if_idle(device_id);
        }
        removed
    }

    /// 向设备的所有当前订阅者发布事件，返回投递数
    ///
    /// 设备仍有所有者但频道不存在时（例如服务重启后）会重新创建频道以延续序号。
    pub fn publish(&self, device_id: &str, event: PresenceEvent) -> usize {
        let Some(mut channel) = self.channel_for_publish(device_id) else {
            debug!("Dropping presence event for unknown device {}", device_id);
            return 0;
        };
        self.deliver(&mut channel, device_id, event)
    }

    /// 在频道锁内写入设备库，成功后发布由写入结果生成的事件
    ///
    /// 同一设备的并发写入按写入顺序编号，订阅者最后看到的状态与设备库一致。
    /// 写入失败时不发布。
    pub fn publish_with<T, W, E>(&self, device_id: &str, write: W, event: E) -> AppResult<T>
    where
        W: FnOnce() -> AppResult<T>,
        E: FnOnce(&T) -> PresenceEvent,
    {
        let Some(mut channel) = self.channel_for_publish(device_id) else {
            return write();
        };
        let value = write()?;
        self.deliver(&mut channel, device_id, event(&value));
        Ok(value)
    }

    /// 向设备的订阅者推送 `DeviceRemoved` 并强制其离开
    ///
    /// `owner` 为 None 时作用于所有订阅者，否则只作用于该账号的订阅者。
    /// 返回被移出的订阅者数。
    pub fn evict(&self, device_id: &str, owner: Option<&str>) -> usize {
        let evicted = match self.channels.get_mut(device_id) {
            Some(mut channel) => {
                channel.seq += 1;
                let delivery = PresenceDelivery {
                    device_id: device_id.to_string(),
                    seq: channel.seq,
                    event: PresenceEvent::DeviceRemoved,
                };
                let targets: Vec<SubscriberId> = channel
                    .subscribers
                    .iter()
                    .copied()
                    .filter(|id| match owner {
                        None => true,
                        Some(owner) => self
                            .subscribers
                            .get(id)
                            .is_some_and(|s| s.user_id == owner),
                    })
                    .collect();
                let target_set: HashSet<_> = targets.iter().copied().collect();
                self.fan_out(&mut channel, &delivery, |id| target_set.contains(id));
                for id in &targets {
                    channel.subscribers.remove(id);
                }
                targets.len()
            }
            None => 0,
        };

        info!("Evicted {} subscribers from {}", evicted, device_id);
        self.collect_if_idle(device_id);
        evicted
    }

    /// 拉取设备当前状态（不订阅）
    pub fn snapshot(&self, device_id: &str) -> AppResult<DeviceSnapshot> {
        let seq = self.channels.get(device_id).map(|c| c.seq).unwrap_or(0);
        self.registry
            .get(device_id)
            .map(|device| DeviceSnapshot::from_device(&device, seq))
            .ok_or_else(|| AppError::DeviceNotFound(device_id.to_string()))
    }

    pub fn subscribers(&self, device_id: &str) -> Vec<SubscriberId> {
        self.channels
            .get(device_id)
            .map(|c| c.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_channel(&self, device_id: &str) -> bool {
        self.channels.contains_key(device_id)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// 订阅者当前加入的设备
    pub fn rooms_of(&self, subscriber_id: SubscriberId) -> Vec<String> {
        self.channels
            .iter()
            .filter(|e| e.value().subscribers.contains(&subscriber_id))
            .map(|e| e.key().clone())
            .collect()
    }

    fn deliver(&self, channel: &mut DeviceChannel, device_id: &str, event: PresenceEvent) -> usize {
        channel.seq += 1;
        let delivery = PresenceDelivery {
            device_id: device_id.to_string(),
            seq: channel.seq,
            event,
        };
        self.fan_out(channel, &delivery, |_| true)
    }

    fn channel_for_publish(&self, device_id: &str) -> Option<RefMut<'_, String, DeviceChannel>> {
        if let Some(channel) = self.channels.get_mut(device_id) {
            return Some(channel);
        }
        if self.registry.has_owner(device_id) {
            return Some(self.channels.entry(device_id.to_string()).or_default());
        }
        None
    }

    /// 在频道锁内投递，已断开的订阅者顺带从频道中移除
    fn fan_out<F>(&self, channel: &mut DeviceChannel, delivery: &PresenceDelivery, filter: F) -> usize
    where
        F: Fn(&SubscriberId) -> bool,
    {
        let mut delivered = 0;
        let mut stale = Vec::new();

        for id in channel.subscribers.iter().filter(|id| filter(*id)) {
            let sent = self
                .subscribers
                .get(id)
                .is_some_and(|s| s.tx.send(delivery.clone()).is_ok());
            if sent {
                delivered += 1;
            } else {
                stale.push(*id);
            }
        }

        for id in stale {
            warn!("Pruning stale subscriber {} from {}", id, delivery.device_id);
            channel.subscribers.remove(&id);
            self.subscribers.remove(&id);
        }
        delivered
    }

    /// 无订阅者且设备无所有者时回收频道
    fn collect_if_idle(&self, device_id: &str) {
        let removed = self.channels.remove_if(device_id, |_, channel| {
            channel.subscribers.is_empty() && !self.registry.has_owner(device_id)
        });
        if removed.is_some() {
            info!("Presence channel closed for {}", device_id);
        }
    }
}
