//! 鉴权请求层
//!
//! 获取当前账号的设备列表、解除设备关联。HTTP 实现自动附加 Bearer 凭证，
//! 非 2xx 响应转为 [`AppError::Api`]，带上响应体中可选的 `message` 字段。

use std::future::Future;
use std::sync::{Arc, RwLock};

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::device::{DeviceFilter, DeviceListResult};
use crate::network::Coordinator;
use crate::{AppError, AppResult};

/// 设备相关的后端接口
pub trait DeviceApi: Send + Sync {
    /// 当前账号的设备列表
    fn list_devices(&self) -> impl Future<Output = AppResult<DeviceListResult>> + Send;

    /// 解除当前账号与设备的关联
    fn dissociate(&self, device_id: &str) -> impl Future<Output = AppResult<()>> + Send;
}

impl<T: DeviceApi> DeviceApi for Arc<T> {
    fn list_devices(&self) -> impl Future<Output = AppResult<DeviceListResult>> + Send {
        (**self).list_devices()
    }

    fn dissociate(&self, device_id: &str) -> impl Future<Output = AppResult<()>> + Send {
        (**self).dissociate(device_id)
    }
}

/// 错误响应体
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// 基于 HTTP 的后端接口
pub struct HttpDeviceApi {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpDeviceApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            token: RwLock::new(None),
        }
    }

    /// 登录后设置凭证，传 `None` 表示登出
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }

    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|g| g.clone())
    }

    /// 构建带凭证的请求，没有凭证时不发出请求
    fn authorized(&self, method: Method, path: &str) -> AppResult<RequestBuilder> {
        let token = self.token().ok_or(AppError::Unauthorized)?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> AppResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!("Backend request failed with {}", status);
        Err(api_error(status, &body))
    }
}

/// 401 视为凭证失效，其余状态码带上响应体中的 `message`
fn api_error(status: StatusCode, body: &str) -> AppError {
    if status == StatusCode::UNAUTHORIZED {
        return AppError::Unauthorized;
    }
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.is_empty());
    AppError::Api {
        status: status.as_u16(),
        message,
    }
}

impl DeviceApi for HttpDeviceApi {
    async fn list_devices(&self) -> AppResult<DeviceListResult> {
        let request = self.authorized(Method::GET, "/devices")?;
        let result: DeviceListResult = self.send(request).await?.json().await?;
        debug!("Fetched {} devices", result.total);
        Ok(result)
    }

    async fn dissociate(&self, device_id: &str) -> AppResult<()> {
        let request = self.authorized(Method::POST, &format!("/devices/{device_id}/dissociate"))?;
        self.send(request).await?;
        Ok(())
    }
}

/// 进程内实现，直接调用 [`Coordinator`]
pub struct LocalDeviceApi {
    coordinator: Arc<Coordinator>,
    user_id: String,
}

impl LocalDeviceApi {
    pub fn new(coordinator: Arc<Coordinator>, user_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            user_id: user_id.into(),
        }
    }
}

impl DeviceApi for LocalDeviceApi {
    fn list_devices(&self) -> impl Future<Output = AppResult<DeviceListResult>> + Send {
        std::future::ready(Ok(self
            .coordinator
            .devices_for(&self.user_id, DeviceFilter::All)))
    }

    fn dissociate(&self, device_id: &str) -> impl Future<Output = AppResult<()>> + Send {
        std::future::ready(
            self.coordinator
                .dissociate(device_id, &self.user_id)
                .map(|_| ()),
        )
    }
}
