/// 注册工作任务
///
/// 每个身份一个任务：首次注册、到期前刷新、取消时发送 Expires: 0 注销。
/// 只要有 REGISTER 可能已被服务器接受（包括请求途中被取消），取消时都会注销。
/// 注销由控制器发起并由控制器通知，任务本身只上报注册成功与失败
use super::{AuthInfo, EngineEvent, EngineEventSender, ProxyConfig};
use crate::types::{RegistrationHandle, RegistrationState};
use rsip::StatusCode;
use rsipstack::{
    dialog::{authenticate::Credential, registration::Registration},
    transaction::endpoint::EndpointInnerRef,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 提前刷新的余量（秒）
const REFRESH_MARGIN_SECS: u64 = 30;

/// 最短刷新间隔（秒）
const MIN_REFRESH_SECS: u64 = 10;

/// 注销等待上限
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// 一个身份的注册任务
pub(crate) struct RegistrationWorker {
    auth: AuthInfo,
    proxy: ProxyConfig,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl RegistrationWorker {
    pub(crate) fn spawn(
        endpoint: EndpointInnerRef,
        auth: AuthInfo,
        proxy: ProxyConfig,
        events: EngineEventSender,
        parent_token: &CancellationToken,
    ) -> Result<Self, rsip::Error> {
        let server_uri: rsip::Uri = proxy.server.as_str().try_into()?;
        let cancel_token = parent_token.child_token();

        let credential = Credential {
            username: auth.username.clone(),
            password: auth.password.clone(),
            realm: auth.realm.clone(),
        };
        let mut registration = Registration::new(endpoint, Some(credential));
        registration.call_id = crate::utils::make_call_id(None);

        let task = tokio::spawn(run_registration(
            registration,
            server_uri,
            proxy.handle.clone(),
            proxy.generation,
            proxy.expires,
            events,
            cancel_token.clone(),
        ));

        Ok(Self {
            auth,
            proxy,
            cancel_token,
            task,
        })
    }

    pub(crate) fn auth(&self) -> &AuthInfo {
        &self.auth
    }

    pub(crate) fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    /// 停止刷新并等待注销完成
    pub(crate) async fn stop(self) {
        self.cancel_token.cancel();
        if tokio::time::timeout(UNREGISTER_TIMEOUT, self.task).await.is_err() {
            warn!("注销超时: {}", self.proxy.handle);
        }
    }
}

fn refresh_interval(expires: u32) -> Duration {
    let secs = u64::from(expires)
        .saturating_sub(REFRESH_MARGIN_SECS)
        .max(MIN_REFRESH_SECS);
    Duration::from_secs(secs)
}

/// 一次 REGISTER 结束后服务器上是否可能留有绑定
///
/// 没有最终响应（请求途中被取消、超时或传输错误）时按可能已绑定处理
fn may_leave_binding(final_status: Option<&StatusCode>) -> bool {
    match final_status {
        Some(status) => *status == StatusCode::OK,
        None => true,
    }
}

fn report(
    events: &EngineEventSender,
    handle: &RegistrationHandle,
    generation: u64,
    state: RegistrationState,
    status_code: Option<u16>,
    reason: Option<String>,
) {
    let event = EngineEvent::Registration {
        handle: handle.clone(),
        generation,
        state,
        status_code,
        reason,
    };
    if events.send(event).is_err() {
        debug!("事件通道已关闭，丢弃注册事件: {}", handle);
    }
}

async fn run_registration(
    mut registration: Registration,
    server_uri: rsip::Uri,
    handle: RegistrationHandle,
    generation: u64,
    expires: u32,
    events: EngineEventSender,
    cancel_token: CancellationToken,
) {
    let mut may_be_bound = false;

    loop {
        info!("正在注册: {} -> {}", handle, server_uri);

        let outcome = tokio::select! {
            result = registration.register(server_uri.clone(), Some(expires)) => result,
            _ = cancel_token.cancelled() => {
                may_be_bound = true;
                break;
            }
        };
        may_be_bound =
            may_be_bound || may_leave_binding(outcome.as_ref().ok().map(|r| &r.status_code));

        match outcome {
            Ok(response) if response.status_code == StatusCode::OK => {
                info!("✔ 注册成功: {} ({})", handle, response.status_code);
                report(
                    &events,
                    &handle,
                    generation,
                    RegistrationState::Registered,
                    Some(response.status_code.code()),
                    None,
                );
            }
            Ok(response) => {
                warn!("注册响应: {} {}", handle, response.status_code);
                report(
                    &events,
                    &handle,
                    generation,
                    RegistrationState::RegistrationFailed,
                    Some(response.status_code.code()),
                    Some(response.status_code.to_string()),
                );
                break;
            }
            Err(e) => {
                warn!("注册失败: {} {}", handle, e);
                report(
                    &events,
                    &handle,
                    generation,
                    RegistrationState::RegistrationFailed,
                    None,
                    Some(e.to_string()),
                );
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(refresh_interval(expires)) => {
                debug!("刷新注册: {}", handle);
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    // 失败后保持任务存活，直到被取消
    cancel_token.cancelled().await;

    if may_be_bound {
        info!("正在注销: {}", handle);
        match registration.register(server_uri, Some(0)).await {
            Ok(response) if response.status_code == StatusCode::OK => {
                info!("✔ 注销成功: {}", handle);
            }
            Ok(response) => warn!("注销响应: {} {}", handle, response.status_code),
            Err(e) => warn!("注销失败: {} {}", handle, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_interval() {
        assert_eq!(refresh_interval(3600), Duration::from_secs(3570));
        assert_eq!(refresh_interval(20), Duration::from_secs(MIN_REFRESH_SECS));
        assert_eq!(refresh_interval(0), Duration::from_secs(MIN_REFRESH_SECS));
    }

    #[test]
    fn test_unanswered_register_is_treated_as_bound() {
        assert!(may_leave_binding(None));
        assert!(may_leave_binding(Some(&StatusCode::OK)));
        assert!(!may_leave_binding(Some(&StatusCode::Forbidden)));
        assert!(!may_leave_binding(Some(&StatusCode::Unauthorized)));
    }
}
