/// SIP 引擎抽象
///
/// 生命周期控制器通过 `SipEngine` trait 驱动底层 SIP 协议栈。
/// 引擎的异步状态变化（注册结果、对端挂断、收到消息）通过 `EngineEvent` 通道上报。
///
/// - `SipEngine` trait: 定义引擎操作接口
/// - `RsipEngine`: 基于 rsipstack 的实现
mod registration;
mod rsip_engine;

#[cfg(test)]
pub(crate) mod mock;

pub use self::rsip_engine::RsipEngine;

use crate::config::Account;
use crate::error::{ConfigError, SipResult};
use crate::types::{CallId, CallState, RegistrationHandle, RegistrationState};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

/// 拨号号码允许的字符
static NUMBER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+*#._\-]+$").expect("valid number regex"));

/// 认证信息 (AuthInfo)
///
/// 用于应答 401/407 认证挑战
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: String,
    pub password: String,
    /// 认证域，None 表示从挑战响应中提取
    pub realm: Option<String>,
}

/// 代理配置 (ProxyConfig)
///
/// 一个已注册身份及其服务器路由
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub handle: RegistrationHandle,
    /// 注册代次，同一句柄每次注册都不同，用于识别过期上报
    pub generation: u64,
    /// 身份 URI，例如 `sip:1001@pbx.example.com`
    pub identity: String,
    /// 注册服务器 URI，例如 `sip:pbx.example.com:5060`
    pub server: String,
    pub expires: u32,
}

impl Account {
    pub fn auth_info(&self) -> AuthInfo {
        AuthInfo {
            username: self.username.clone(),
            password: self.password.clone(),
            realm: None,
        }
    }

    pub fn proxy_config(
        &self,
        handle: RegistrationHandle,
        generation: u64,
        expires: u32,
    ) -> ProxyConfig {
        ProxyConfig {
            handle,
            generation,
            identity: self.identity_uri(),
            server: self.server_uri(),
            expires,
        }
    }
}

/// 呼叫目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    /// 被叫号码，或完整的 `user@host`
    pub number: String,
    /// 被叫主机，空字符串表示使用当前注册服务器
    pub host: String,
    pub port: u16,
    pub video: bool,
}

impl CallTarget {
    pub fn new(number: &str, host: &str, port: u16, video: bool) -> Result<Self, ConfigError> {
        let number = number.trim().trim_start_matches("sip:");
        if number.is_empty() {
            return Err(ConfigError::Missing("phone number".to_string()));
        }
        let user = number.split('@').next().unwrap_or_default();
        if !NUMBER_REGEX.is_match(user) {
            return Err(ConfigError::Invalid(format!("号码无效: {}", number)));
        }
        Ok(Self {
            number: number.to_string(),
            host: host.trim().to_string(),
            port,
            video,
        })
    }

    /// 被叫用户部分（`@` 之前）
    pub fn user(&self) -> &str {
        self.number.split('@').next().unwrap_or_default()
    }

    /// 主机为空时使用默认路由
    pub fn with_default_host(mut self, host: &str, port: u16) -> Self {
        if self.host.is_empty() {
            self.host = host.to_string();
            self.port = port;
        }
        self
    }

    /// 被叫 URI
    pub fn uri(&self) -> String {
        if self.number.contains('@') {
            format!("sip:{}", self.number)
        } else if self.port == 0 {
            format!("sip:{}@{}", self.number, self.host)
        } else {
            format!("sip:{}@{}:{}", self.number, self.host, self.port)
        }
    }
}

/// 引擎上报的状态变化
///
/// 状态码与原因均为 SIP 协议栈自身的值，不做归一化
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Registration {
        handle: RegistrationHandle,
        generation: u64,
        state: RegistrationState,
        status_code: Option<u16>,
        reason: Option<String>,
    },
    Call {
        call_id: CallId,
        state: CallState,
        status_code: Option<u16>,
        reason: Option<String>,
    },
    Message {
        from: String,
        body: String,
    },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// SIP 引擎 trait
///
/// 所有方法都在控制器持有的引擎锁内调用
#[async_trait]
pub trait SipEngine: Send + Sync {
    /// 启动引擎，之后的状态变化写入 `events`
    async fn start(&mut self, events: EngineEventSender) -> SipResult<()>;

    /// 清除全部认证信息与代理配置
    async fn clear_identities(&mut self) -> SipResult<()>;

    /// 添加身份并开始注册，注册结果通过事件上报
    async fn add_identity(&mut self, auth: AuthInfo, proxy: ProxyConfig) -> SipResult<()>;

    /// 移除身份（发送注销）
    async fn remove_identity(&mut self, handle: &RegistrationHandle) -> SipResult<()>;

    /// 网络是否可用
    fn is_network_reachable(&self) -> bool;

    /// 发起呼叫，呼叫进展通过事件上报
    async fn invite(&mut self, call_id: &CallId, target: &CallTarget) -> SipResult<()>;

    /// 结束指定呼叫
    async fn terminate_call(&mut self, call_id: &CallId) -> SipResult<()>;

    /// 结束全部呼叫
    async fn terminate_all_calls(&mut self) -> SipResult<()>;

    /// 关闭引擎
    async fn shutdown(&mut self);
}
