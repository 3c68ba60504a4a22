//! 应用层协议类型
//!
//! 客户端与服务端之间的发布/订阅消息，JSON 编码。
//! 每个请求都带 `requestId`，服务端对每个请求都回复一条消息（成功或 `request-failed`），
//! 客户端据此实现请求/响应语义。

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{DeviceSnapshot, DeviceStatus, PlaylistAssociation};
use crate::{events, AppError};

/// 配对码兑换失败原因
///
/// 除 `Timeout` 外都由服务端给出，且对该配对码是终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedeemFailure {
    /// 没有对应的待兑换配对码
    NotFound,
    /// 超过有效期
    Expired,
    /// 已被其他请求兑换
    AlreadyConsumed,
    /// 不是 9 位数字（客户端本地拦截）
    Malformed,
    /// 等待超时（客户端合成）
    Timeout,
}

impl RedeemFailure {
    /// 界面展示的错误信息
    pub fn message(self) -> &'static str {
        match self {
            Self::NotFound => "配对码不存在，请核对电视上显示的数字",
            Self::Expired => "配对码已过期，请在电视上重新生成",
            Self::AlreadyConsumed => "配对码已被使用，请在电视上重新生成",
            Self::Malformed => "请输入 9 位数字配对码",
            Self::Timeout => "等待电视响应超时，可以重试同一配对码",
        }
    }

    /// 是否可以用同一个配对码重试
    ///
    /// 超时时配对码可能仍处于待兑换状态；其余失败都需要新的配对码。
    pub fn allows_same_code_retry(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for RedeemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// 兑换结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "outcome")]
pub enum RedeemOutcome {
    Success {
        device_id: String,
        device_name: String,
    },
    Failure {
        reason: RedeemFailure,
    },
}

impl RedeemOutcome {
    pub fn failure(reason: RedeemFailure) -> Self {
        Self::Failure { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// 设备频道推送的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "camelCase", tag = "type")]
pub enum PresenceEvent {
    StatusChanged {
        status: DeviceStatus,
    },
    LastSeen {
        last_seen_at: i64,
    },
    AssociationsChanged {
        associations: Vec<PlaylistAssociation>,
    },
    /// 设备已解除关联，频道随后关闭
    DeviceRemoved,
}

/// 推送给单个订阅者的事件
///
/// `seq` 按设备递增，订阅者据此丢弃重复投递。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDelivery {
    pub device_id: String,
    pub seq: u64,
    pub event: PresenceEvent,
}

/// 错误消息体，对应 [`AppError`] 的 `{ kind, message }` 序列化格式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl From<&AppError> for ErrorPayload {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.message(),
        }
    }
}

impl From<ErrorPayload> for AppError {
    fn from(payload: ErrorPayload) -> Self {
        AppError::Remote {
            kind: payload.kind,
            message: payload.message,
        }
    }
}

/// 客户端 → 服务端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    rename_all = "kebab-case",
    rename_all_fields = "camelCase",
    tag = "event",
    content = "data"
)]
pub enum ClientMessage {
    RedeemCodeRequest {
        request_id: Uuid,
        code: String,
        user_id: String,
    },
    JoinRoom {
        request_id: Uuid,
        room: String,
    },
    LeaveRoom {
        request_id: Uuid,
        room: String,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::RedeemCodeRequest { request_id, .. }
            | Self::JoinRoom { request_id, .. }
            | Self::LeaveRoom { request_id, .. } => *request_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RedeemCodeRequest { .. } => events::REDEEM_CODE_REQUEST,
            Self::JoinRoom { .. } => events::JOIN_ROOM,
            Self::LeaveRoom { .. } => events::LEAVE_ROOM,
        }
    }
}

/// 服务端 → 客户端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    rename_all = "kebab-case",
    rename_all_fields = "camelCase",
    tag = "event",
    content = "data"
)]
pub enum ServerMessage {
    RedeemCodeSuccess {
        request_id: Uuid,
        device_id: String,
        device_name: String,
    },
    RedeemCodeError {
        request_id: Uuid,
        reason: RedeemFailure,
    },
    RoomJoined {
        request_id: Uuid,
        room: String,
        snapshot: DeviceSnapshot,
    },
    RoomLeft {
        request_id: Uuid,
        room: String,
    },
    RequestFailed {
        request_id: Uuid,
        error: ErrorPayload,
    },
    Presence {
        room: String,
        delivery: PresenceDelivery,
    },
}

impl ServerMessage {
    /// 兑换结果转为回复消息
    pub fn from_outcome(request_id: Uuid, outcome: RedeemOutcome) -> Self {
        match outcome {
            RedeemOutcome::Success {
                device_id,
                device_name,
            } => Self::RedeemCodeSuccess {
                request_id,
                device_id,
                device_name,
            },
            RedeemOutcome::Failure { reason } => Self::RedeemCodeError { request_id, reason },
        }
    }

    pub fn request_failed(request_id: Uuid, err: &AppError) -> Self {
        Self::RequestFailed {
            request_id,
            error: err.into(),
        }
    }

    /// 推送消息没有 request_id
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Self::RedeemCodeSuccess { request_id, .. }
            | Self::RedeemCodeError { request_id, .. }
            | Self::RoomJoined { request_id, .. }
            | Self::RoomLeft { request_id, .. }
            | Self::RequestFailed { request_id, .. } => Some(*request_id),
            Self::Presence { .. } => None,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RedeemCodeSuccess { .. } => events::REDEEM_CODE_SUCCESS,
            Self::RedeemCodeError { .. } => events::REDEEM_CODE_ERROR,
            Self::RoomJoined { .. } => events::ROOM_JOINED,
            Self::RoomLeft { .. } => events::ROOM_LEFT,
            Self::RequestFailed { .. } => events::REQUEST_FAILED,
            Self::Presence { .. } => events::PRESENCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redeem_request_wire_shape() {
        let request_id = Uuid::nil();
        let msg = ClientMessage::RedeemCodeRequest {
            request_id,
            code: "123456789".into(),
            user_id: "u1".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "redeem-code-request",
                "data": {
                    "requestId": "00000000-0000-0000-0000-000000000000",
                    "code": "123456789",
                    "userId": "u1"
                }
            })
        );
        assert_eq!(value["event"], msg.event_name());
    }

    #[test]
    fn redeem_error_reason_is_upper_snake() {
        let msg = ServerMessage::from_outcome(
            Uuid::nil(),
            RedeemOutcome::failure(RedeemFailure::AlreadyConsumed),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "redeem-code-error");
        assert_eq!(value["data"]["reason"], "ALREADY_CONSUMED");
    }

    #[test]
    fn presence_event_tagging() {
        let value = serde_json::to_value(PresenceEvent::LastSeen {
            last_seen_at: 42,
        })
        .unwrap();
        assert_eq!(value, json!({ "type": "last-seen", "lastSeenAt": 42 }));

        let removed: PresenceEvent =
            serde_json::from_value(json!({ "type": "device-removed" })).unwrap();
        assert_eq!(removed, PresenceEvent::DeviceRemoved);
    }

    #[test]
    fn only_timeout_allows_same_code_retry() {
        assert!(RedeemFailure::Timeout.allows_same_code_retry());
        for reason in [
            RedeemFailure::NotFound,
            RedeemFailure::Expired,
            RedeemFailure::AlreadyConsumed,
            RedeemFailure::Malformed,
        ] {
            assert!(!reason.allows_same_code_retry());
        }
    }

    #[test]
    fn failure_messages_are_distinct() {
        let all = [
            RedeemFailure::NotFound,
            RedeemFailure::Expired,
            RedeemFailure::AlreadyConsumed,
            RedeemFailure::Malformed,
            RedeemFailure::Timeout,
        ];
        let messages: std::collections::HashSet<_> = all.iter().map(|r| r.message()).collect();
        assert_eq!(messages.len(), all.len());
    }

    #[test]
    fn error_payload_round_trips_kind() {
        let payload = ErrorPayload::from(&AppError::NotOwner {
            device_id: "tv-1".into(),
        });
        assert_eq!(payload.kind, "NotOwner");
        let err: AppError = payload.into();
        assert_eq!(err.kind(), "NotOwner");
    }
}
