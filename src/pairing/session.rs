//! 客户端配对会话状态机
//!
//! `Idle → Submitting → (Success | Error)`，`Error → Idle` 由用户重试触发，
//! `Success` 为终态，展示一段时间后发出 [`SessionEvent::Completed`]。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::code::{self, CODE_LENGTH};
use super::manager::PairingSessionManager;
use crate::network::config::PairingConfig;
use crate::protocol::{RedeemFailure, RedeemOutcome};
use crate::AppResult;

/// 兑换配对码的一方（进程内管理器或远程传输）
pub trait CodeRedeemer: Send + Sync + 'static {
    fn redeem(
        &self,
        code: &str,
        user_id: &str,
    ) -> impl Future<Output = AppResult<RedeemOutcome>> + Send;
}

impl CodeRedeemer for PairingSessionManager {
    fn redeem(
        &self,
        code: &str,
        user_id: &str,
    ) -> impl Future<Output = AppResult<RedeemOutcome>> + Send {
        std::future::ready(PairingSessionManager::redeem(self, code, user_id))
    }
}

impl<T: CodeRedeemer> CodeRedeemer for Arc<T> {
    fn redeem(
        &self,
        code: &str,
        user_id: &str,
    ) -> impl Future<Output = AppResult<RedeemOutcome>> + Send {
        (**self).redeem(code, user_id)
    }
}

/// 振动反馈
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HapticPattern {
    pub on: Duration,
    pub off: Duration,
    pub pulses: u8,
}

impl HapticPattern {
    /// 配对成功：100ms 振动 / 50ms 间隔 × 3
    pub const SUCCESS: Self = Self {
        on: Duration::from_millis(100),
        off: Duration::from_millis(50),
        pulses: 3,
    };

    /// 失败：两次较长振动
    pub const ERROR: Self = Self {
        on: Duration::from_millis(200),
        off: Duration::from_millis(100),
        pulses: 2,
    };
}

/// 会话失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// 服务端拒绝、本地格式校验失败或等待超时
    Rejected(RedeemFailure),
    /// 传输层或鉴权错误，携带原始错误信息
    Transport(String),
}

impl SessionFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::Rejected(reason) => reason.message(),
            Self::Transport(message) => message,
        }
    }

    /// 请求可能未到达服务端，配对码仍可能有效
    pub fn allows_same_code_retry(&self) -> bool {
        match self {
            Self::Rejected(reason) => reason.allows_same_code_retry(),
            Self::Transport(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle {
        digits: String,
    },
    Submitting {
        code: String,
    },
    Success {
        device_id: String,
        device_name: String,
    },
    Error {
        failure: SessionFailure,
        /// 失败时的输入，超时重试时保留
        code: String,
    },
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle {
            digits: String::new(),
        }
    }
}

/// 会话发给界面层的一次性事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Haptic(HapticPattern),
    /// 成功展示时间结束，界面可以返回
    Completed {
        device_id: String,
        device_name: String,
    },
}

/// `submit` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 当前不在 `Idle`（例如已有提交在进行中），不排队
    Ignored,
    Paired {
        device_id: String,
        device_name: String,
    },
    Failed(SessionFailure),
}

/// 提交进行中的标记
///
/// `submit` 的 future 在得到结果前被丢弃时，把会话从 `Submitting` 移到
/// `Error { Timeout }`，保留输入以便用同一配对码重试。
struct InFlight<'a> {
    state: &'a watch::Sender<SessionState>,
    code: Option<String>,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.code = None;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(code) = self.code.take() else {
            return;
        };
        warn!("Pairing submission abandoned before an outcome");
        self.state.send_if_modified(|state| {
            if !matches!(state, SessionState::Submitting { .. }) {
                return false;
            }
            *state = SessionState::Error {
                failure: SessionFailure::Rejected(RedeemFailure::Timeout),
                code,
            };
            true
        });
    }
}

struct SessionInner<R> {
    redeemer: R,
    user_id: String,
    bound_wait: Duration,
    submit_debounce: Duration,
    success_display: Duration,
    state: watch::Sender<SessionState>,
    /// 每次输入变化递增，防抖任务据此判断输入是否已被修改
    generation: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// 配对会话句柄，克隆后共享同一状态
///
/// `input` 触发的自动提交和成功后的延时事件都通过 `tokio::spawn` 调度，
/// 需要在 Tokio 运行时内使用。
pub struct PairingClientSession<R> {
    inner: Arc<SessionInner<R>>,
}

impl<R> Clone for PairingClientSession<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: CodeRedeemer> PairingClientSession<R> {
    pub fn new(
        redeemer: R,
        user_id: impl Into<String>,
        config: &PairingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            inner: Arc::new(SessionInner {
                redeemer,
                user_id: user_id.into(),
                bound_wait: config.bound_wait,
                submit_debounce: config.submit_debounce,
                success_display: config.success_display,
                state: watch::Sender::new(SessionState::default()),
                generation: AtomicU64::new(0),
                events,
            }),
        };
        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// 订阅状态变化
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// 追加输入，非数字字符被丢弃，最多 9 位
    ///
    /// 凑满 9 位后经过防抖延时自动提交；期间输入有变化则取消这次提交。
    pub fn input(&self, text: &str) {
        let mut completed = false;
        let modified = self.inner.state.send_if_modified(|state| {
            let SessionState::Idle { digits } = state else {
                return false;
            };
            let before = digits.len();
            for c in text.chars().filter(char::is_ascii_digit) {
                if digits.len() >= CODE_LENGTH {
                    break;
                }
                digits.push(c);
            }
            completed = before < CODE_LENGTH && digits.len() == CODE_LENGTH;
            digits.len() != before
        });

        if !modified {
            return;
        }
        let generation = self.bump_generation();
        if completed {
            self.schedule_submit(generation);
        }
    }

    pub fn backspace(&self) {
        let modified = self.inner.state.send_if_modified(|state| match state {
            SessionState::Idle { digits } => digits.pop().is_some(),
            _ => false,
        });
        if modified {
            self.bump_generation();
        }
    }

    /// 提交当前输入并等待结果
    ///
    /// 状态不是 `Idle` 时直接返回 [`SubmitOutcome::Ignored`]。
    /// 不足 9 位在本地以 `Malformed` 拒绝，不会发出请求。
    /// 超过 `bound_wait` 仍无结果时以 `Timeout` 结束。
    pub async fn submit(&self) -> SubmitOutcome {
        let mut claimed = None;
        let mut malformed = false;
        self.inner.state.send_if_modified(|state| {
            let SessionState::Idle { digits } = state else {
                return false;
            };
            let digits = std::mem::take(digits);
            if code::is_well_formed(&digits) {
                claimed = Some(digits.clone());
                *state = SessionState::Submitting { code: digits };
            } else {
                malformed = true;
                *state = SessionState::Error {
                    failure: SessionFailure::Rejected(RedeemFailure::Malformed),
                    code: digits,
                };
            }
            true
        });

        if malformed {
            self.bump_generation();
            self.emit(SessionEvent::Haptic(HapticPattern::ERROR));
            return SubmitOutcome::Failed(SessionFailure::Rejected(RedeemFailure::Malformed));
        }
        let Some(code) = claimed else {
            debug!("Submit ignored, session is not idle");
            return SubmitOutcome::Ignored;
        };
        self.bump_generation();

        debug!("Submitting pairing code {}", code::mask(&code));
        let in_flight = InFlight {
            state: &self.inner.state,
            code: Some(code.clone()),
        };
        let result = tokio::time::timeout(
            self.inner.bound_wait,
            self.inner.redeemer.redeem(&code, &self.inner.user_id),
        )
        .await;
        in_flight.disarm();

        let next = match result {
            Ok(Ok(RedeemOutcome::Success {
                device_id,
                device_name,
            })) => SessionState::Success {
                device_id,
                device_name,
            },
            Ok(Ok(RedeemOutcome::Failure { reason })) => SessionState::Error {
                failure: SessionFailure::Rejected(reason),
                code,
            },
            Ok(Err(e)) => {
                warn!("Pairing request failed: {}", e);
                SessionState::Error {
                    failure: SessionFailure::Transport(e.to_string()),
                    code,
                }
            }
            Err(_) => {
                warn!(
                    "No pairing outcome within {:?}, giving up",
                    self.inner.bound_wait
                );
                SessionState::Error {
                    failure: SessionFailure::Rejected(RedeemFailure::Timeout),
                    code,
                }
            }
        };
        self.inner.state.send_replace(next.clone());

        match next {
            SessionState::Success {
                device_id,
                device_name,
            } => {
                info!("Paired with device {}", device_id);
                self.emit(SessionEvent::Haptic(HapticPattern::SUCCESS));
                self.schedule_completion(device_id.clone(), device_name.clone());
                SubmitOutcome::Paired {
                    device_id,
                    device_name,
                }
            }
            SessionState::Error { failure, .. } => {
                info!("Pairing failed: {}", failure.message());
                self.emit(SessionEvent::Haptic(HapticPattern::ERROR));
                SubmitOutcome::Failed(failure)
            }
            _ => SubmitOutcome::Ignored,
        }
    }

    /// 失败后重新进入 `Idle`
    ///
    /// 超时或传输错误保留原输入，其余失败清空输入。不在 `Error` 时返回 false。
    pub fn retry(&self) -> bool {
        let modified = self.inner.state.send_if_modified(|state| {
            let SessionState::Error { failure, code } = state else {
                return false;
            };
            let digits = if failure.allows_same_code_retry() {
                std::mem::take(code)
            } else {
                String::new()
            };
            *state = SessionState::Idle { digits };
            true
        });
        if modified {
            self.bump_generation();
        }
        modified
    }

    fn bump_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn schedule_submit(&self, generation: u64) {
        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(session.inner.submit_debounce).await;
            if session.inner.generation.load(Ordering::SeqCst) == generation {
                session.submit().await;
            }
        });
    }

    fn schedule_completion(&self, device_id: String, device_name: String) {
        let events = self.inner.events.clone();
        let display = self.inner.success_display;
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            let _ = events.send(SessionEvent::Completed {
                device_id,
                device_name,
            });
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }
}
