pub mod api;
pub mod clock;
pub mod device;
pub mod error;
pub mod events;
pub mod network;
pub mod pairing;
pub mod presence;
pub mod protocol;
pub use error::{AppError, AppResult};

pub use api::{DeviceApi, HttpDeviceApi, LocalDeviceApi};
pub use network::config::PairingConfig;
pub use network::{connect_local, Coordinator, TransportClient};
pub use pairing::{PairingClientSession, PairingSessionManager};
pub use presence::{DeviceWatcher, PresenceHub};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志，`RUST_LOG` 未设置时默认 `tvlink=debug`
///
/// 可重复调用，已初始化时直接返回。
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tvlink=debug")))
        .try_init();
}
