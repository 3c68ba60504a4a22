use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manager::SharedRefs;
use crate::device::DeviceSnapshot;
use crate::presence::{device_room, parse_device_room, SubscriberId};
use crate::protocol::{ClientMessage, RedeemOutcome, ServerMessage};
use crate::{AppError, AppResult};

/// 启动单个客户端连接的事件循环
///
/// 一条连接对应一个订阅者。循环同时消费客户端的请求和该订阅者的在线状态推送，
/// 每个请求都回复一条消息（成功或 `request-failed`）。入站通道关闭、
/// 出站通道断开或协调器关闭时退出，并注销订阅者。
pub(crate) fn spawn_connection_loop(
    shared: SharedRefs,
    user_id: String,
    mut inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = shared.presence.connect(&user_id);
        let subscriber_id = subscription.id;
        info!("Connection opened for {} ({})", user_id, subscriber_id);

        loop {
            let reply = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    match serde_json::from_str::<ClientMessage>(&frame) {
                        Ok(message) => handle_request(&shared, &user_id, subscriber_id, message),
                        Err(e) => {
                            // 无法解析出 requestId，只能丢弃
                            warn!("Dropping malformed frame from {}: {}", user_id, e);
                            continue;
                        }
                    }
                }
                delivery = subscription.recv() => {
                    let Some(delivery) = delivery else { break };
                    ServerMessage::Presence {
                        room: device_room(&delivery.device_id),
                        delivery,
                    }
                }
            };

            if !send(&outbound, &reply) {
                break;
            }
        }

        shared.presence.disconnect(subscriber_id);
        info!("Connection closed for {} ({})", user_id, subscriber_id);
    })
}

fn send(outbound: &mpsc::UnboundedSender<String>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(frame) => outbound.send(frame).is_ok(),
        Err(e) => {
            warn!("Failed to encode {}: {}", message.event_name(), e);
            true
        }
    }
}

fn handle_request(
    shared: &SharedRefs,
    user_id: &str,
    subscriber_id: SubscriberId,
    message: ClientMessage,
) -> ServerMessage {
    let request_id = message.request_id();
    debug!("{} from {}", message.event_name(), user_id);

    let result = match message {
        ClientMessage::RedeemCodeRequest {
            request_id,
            code,
            user_id: claimed,
        } => redeem(shared, user_id, &claimed, subscriber_id, request_id, &code),
        ClientMessage::JoinRoom { request_id, room } => {
            join(shared, subscriber_id, &room).map(|snapshot| {
                ServerMessage::RoomJoined {
                    request_id,
                    room,
                    snapshot,
                }
            })
        }
        ClientMessage::LeaveRoom { request_id, room } => {
            leave(shared, subscriber_id, &room).map(|()| ServerMessage::RoomLeft { request_id, room })
        }
    };

    result.unwrap_or_else(|e| {
        debug!("Request {} failed: {}", request_id, e);
        ServerMessage::request_failed(request_id, &e)
    })
}

/// 兑换成功后当前连接自动加入设备房间
fn redeem(
    shared: &SharedRefs,
    user_id: &str,
    claimed: &str,
    subscriber_id: SubscriberId,
    request_id: Uuid,
    code: &str,
) -> AppResult<ServerMessage> {
    // 以连接的身份为准，请求体中的 userId 必须一致
    if claimed != user_id {
        warn!("Redeem request claims {} on connection of {}", claimed, user_id);
        return Err(AppError::Unauthorized);
    }

    let outcome = shared.pairing.redeem(code, user_id)?;
    if let RedeemOutcome::Success { device_id, .. } = &outcome {
        if let Err(e) = shared.presence.join(device_id, subscriber_id) {
            warn!("Auto-join after pairing {} failed: {}", device_id, e);
        }
    }
    Ok(ServerMessage::from_outcome(request_id, outcome))
}

/// 订阅者以连接的账号加入，所有权由 [`PresenceHub::join`](crate::presence::PresenceHub::join) 检查
fn join(shared: &SharedRefs, subscriber_id: SubscriberId, room: &str) -> AppResult<DeviceSnapshot> {
    let device_id = parse_device_room(room).ok_or_else(|| AppError::InvalidRoom(room.into()))?;
    shared.presence.join(device_id, subscriber_id)
}

/// 离开未加入的房间不算错误
fn leave(shared: &SharedRefs, subscriber_id: SubscriberId, room: &str) -> AppResult<()> {
    let device_id = parse_device_room(room).ok_or_else(|| AppError::InvalidRoom(room.into()))?;
    shared.presence.leave(device_id, subscriber_id);
    Ok(())
}
