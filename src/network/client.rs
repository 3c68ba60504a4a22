use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::device::DeviceSnapshot;
use crate::pairing::CodeRedeemer;
use crate::presence::device_room;
use crate::protocol::{ClientMessage, PresenceDelivery, RedeemOutcome, ServerMessage};
use crate::{AppError, AppResult};

type PendingMap = DashMap<Uuid, oneshot::Sender<ServerMessage>>;

/// 客户端传输层
///
/// 在单条双向连接上复用兑换请求和多个设备房间。请求按 `requestId` 匹配回复，
/// 在线状态推送转发到 [`TransportClient::new`] 返回的接收端。
pub struct TransportClient {
    user_id: String,
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<PendingMap>,
    reader: JoinHandle<()>,
}

/// 等待回复期间登记在 pending 表中，future 被丢弃（例如超时）时自动移除
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

impl TransportClient {
    pub fn new(
        user_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceDelivery>) {
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let reader = spawn_reader(inbound, pending.clone(), presence_tx);
        let client = Self {
            user_id: user_id.into(),
            outbound,
            pending,
            reader,
        };
        (client, presence_rx)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// 等待回复的请求数
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// 发送请求并等待对应回复，`request-failed` 转为 [`AppError::Remote`]
    pub async fn request(&self, message: ClientMessage) -> AppResult<ServerMessage> {
        let request_id = message.request_id();
        let frame = serde_json::to_string(&message)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };

        self.outbound
            .send(frame)
            .map_err(|_| AppError::ConnectionClosed)?;
        debug!("Sent {} ({})", message.event_name(), request_id);

        match rx.await.map_err(|_| AppError::ConnectionClosed)? {
            ServerMessage::RequestFailed { error, .. } => Err(error.into()),
            reply => Ok(reply),
        }
    }

    /// 以指定账号兑换配对码
    pub async fn redeem_as(&self, code: &str, user_id: &str) -> AppResult<RedeemOutcome> {
        let reply = self
            .request(ClientMessage::RedeemCodeRequest {
                request_id: Uuid::new_v4(),
                code: code.to_string(),
                user_id: user_id.to_string(),
            })
            .await?;

        match reply {
            ServerMessage::RedeemCodeSuccess {
                device_id,
                device_name,
                ..
            } => Ok(RedeemOutcome::Success {
                device_id,
                device_name,
            }),
            ServerMessage::RedeemCodeError { reason, .. } => Ok(RedeemOutcome::failure(reason)),
            other => Err(AppError::UnexpectedReply(other.event_name())),
        }
    }

    /// 加入设备房间，返回设备当前快照
    pub async fn join_room(&self, device_id: &str) -> AppResult<DeviceSnapshot> {
        let reply = self
            .request(ClientMessage::JoinRoom {
                request_id: Uuid::new_v4(),
                room: device_room(device_id),
            })
            .await?;

        match reply {
            ServerMessage::RoomJoined { snapshot, .. } => Ok(snapshot),
            other => Err(AppError::UnexpectedReply(other.event_name())),
        }
    }

    pub async fn leave_room(&self, device_id: &str) -> AppResult<()> {
        let reply = self
            .request(ClientMessage::LeaveRoom {
                request_id: Uuid::new_v4(),
                room: device_room(device_id),
            })
            .await?;

        match reply {
            ServerMessage::RoomLeft { .. } => Ok(()),
            other => Err(AppError::UnexpectedReply(other.event_name())),
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl CodeRedeemer for TransportClient {
    fn redeem(
        &self,
        code: &str,
        user_id: &str,
    ) -> impl Future<Output = AppResult<RedeemOutcome>> + Send {
        self.redeem_as(code, user_id)
    }
}

/// 读取服务端消息：回复交给等待中的请求，推送转发给订阅方
fn spawn_reader(
    mut inbound: mpsc::UnboundedReceiver<String>,
    pending: Arc<PendingMap>,
    presence: mpsc::UnboundedSender<PresenceDelivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            let message = match serde_json::from_str::<ServerMessage>(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping malformed server frame: {}", e);
                    continue;
                }
            };

            match message {
                ServerMessage::Presence { delivery, .. } => {
                    let _ = presence.send(delivery);
                }
                reply => {
                    let Some(request_id) = reply.request_id() else {
                        continue;
                    };
                    match pending.remove(&request_id) {
                        Some((_, tx)) => {
                            let _ = tx.send(reply);
                        }
                        None => debug!("No pending request for reply {}", request_id),
                    }
                }
            }
        }

        // 连接断开：丢弃所有等待者，它们收到 ConnectionClosed
        pending.clear();
        debug!("Transport reader finished");
    })
}
