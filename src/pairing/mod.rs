//! 配对模块
//!
//! 设备端生成 9 位数字配对码，客户端输入后兑换。服务端由
//! [`PairingSessionManager`](manager::PairingSessionManager) 保证每个配对码最多兑换一次；
//! 客户端由 [`PairingClientSession`](session::PairingClientSession) 驱动输入、提交、
//! 有界等待和重试。

pub mod code;
pub mod manager;
pub mod session;

pub use manager::PairingSessionManager;
pub use session::{
    CodeRedeemer, HapticPattern, PairingClientSession, SessionEvent, SessionFailure, SessionState,
    SubmitOutcome,
};
