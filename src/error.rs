//! 应用错误处理模块
//!
//! 错误需要实现 Serialize 才能传递给界面层，统一转为 `{ kind, message }` 格式。
//! 配对码兑换失败（过期、已被消耗等）属于业务结果，见
//! [`RedeemFailure`](crate::protocol::RedeemFailure)，不在这里。

use serde::Serialize;
use thiserror::Error;

/// 应用统一错误类型
///
/// 注意：使用 `#[from]` 的变体会存储原始错误类型，
/// 但由于 `reqwest::Error` 等不实现 `Serialize`，
/// 通过自定义 Serialize 实现统一转为 `{ kind, message }` 格式。
#[derive(Debug, Error)]
pub enum AppError {
    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP 传输错误
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 后端接口返回非 2xx
    #[error("Request failed ({status}): {}", .message.as_deref().unwrap_or("未知错误"))]
    Api {
        status: u16,
        message: Option<String>,
    },

    /// 凭证缺失或已失效
    #[error("未登录或登录已过期")]
    Unauthorized,

    /// 设备不存在
    #[error("设备不存在: {0}")]
    DeviceNotFound(String),

    /// 当前账号不是该设备的所有者
    #[error("无权操作设备: {device_id}")]
    NotOwner { device_id: String },

    /// 播放列表关联不满足约束（最多一个激活）
    #[error("Invalid playlist associations: {0}")]
    InvalidAssociations(String),

    /// 配对码格式错误（必须为 9 位数字）
    #[error("无效的配对码")]
    InvalidCode,

    /// 配对码与仍在有效期内的配对码冲突
    #[error("配对码已被占用")]
    CodeInUse,

    /// 订阅者未连接
    #[error("Subscriber not connected")]
    SubscriberNotFound,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 房间名不是 `device:<id>` 格式
    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    /// 收到与请求不匹配的回复
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(&'static str),

    /// 对端返回的错误（保留原始 kind）
    #[error("{message}")]
    Remote { kind: String, message: String },
}

impl AppError {
    /// 序列化时使用的错误类别
    pub fn kind(&self) -> &str {
        match self {
            AppError::Serialization(_) => "Serialization",
            AppError::Http(_) => "Http",
            AppError::Api { .. } => "Api",
            AppError::Unauthorized => "Unauthorized",
            AppError::DeviceNotFound(_) => "DeviceNotFound",
            AppError::NotOwner { .. } => "NotOwner",
            AppError::InvalidAssociations(_) => "InvalidAssociations",
            AppError::InvalidCode => "InvalidCode",
            AppError::CodeInUse => "CodeInUse",
            AppError::SubscriberNotFound => "SubscriberNotFound",
            AppError::ConnectionClosed => "ConnectionClosed",
            AppError::InvalidRoom(_) => "InvalidRoom",
            AppError::UnexpectedReply(_) => "UnexpectedReply",
            AppError::Remote { kind, .. } => kind,
        }
    }

    /// 展示给用户的消息：后端或远端给出的原始消息优先，否则用错误描述
    pub fn message(&self) -> String {
        match self {
            AppError::Api {
                message: Some(msg), ..
            } => msg.clone(),
            AppError::Remote { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }
}

/// 传递给界面层的序列化错误格式
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("AppError", 2)?;

        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.message())?;
        state.end()
    }
}

// ============ 便捷类型别名 ============

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;
