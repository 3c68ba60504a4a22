//! 传输层事件名常量
//!
//! 所有客户端 ↔ 服务端的事件名集中定义，避免硬编码字符串散落各模块。
//! 序列化标签与这里保持一致，见 [`protocol`](crate::protocol)。

// === 配对码兑换 ===
pub const REDEEM_CODE_REQUEST: &str = "redeem-code-request";
pub const REDEEM_CODE_SUCCESS: &str = "redeem-code-success";
pub const REDEEM_CODE_ERROR: &str = "redeem-code-error";

// === 设备房间 ===
pub const JOIN_ROOM: &str = "join-room";
pub const LEAVE_ROOM: &str = "leave-room";
pub const ROOM_JOINED: &str = "room-joined";
pub const ROOM_LEFT: &str = "room-left";

// === 推送 ===
pub const PRESENCE: &str = "presence";
pub const REQUEST_FAILED: &str = "request-failed";
