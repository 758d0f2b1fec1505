// 声明所有模块
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod ffi;
pub mod registry;
pub mod sdp;
pub mod sip_transport;
pub mod types;
pub mod utils;

/// 重新导出thiserror错误类型
pub use crate::error::{CallError, CallResult, ConfigError, SipError, SipResult};

/// 主要API重新导出，简化使用
pub use crate::config::{Account, EngineConfig};
pub use crate::controller::LifecycleController;
pub use crate::engine::{CallTarget, RsipEngine, SipEngine};
pub use crate::events::{ChannelSink, EventSink, LogSink, PhoneEvent};
pub use crate::types::{CallId, CallState, RegistrationHandle, RegistrationState};

/// 版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 便捷函数：创建基于 rsipstack 的话机控制器
///
/// 返回的控制器需要先调用 `init()` 启动引擎
pub fn create_phone(config: EngineConfig) -> LifecycleController<RsipEngine> {
    let expires = config.register_expires;
    LifecycleController::new(RsipEngine::new(config)).with_register_expires(expires)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_create_phone_requires_init() {
        let phone = create_phone(EngineConfig::default());
        let target = CallTarget::new("1002", "127.0.0.1", 5060, false).unwrap();
        assert!(matches!(
            phone.call(target).await,
            Err(CallError::NotInitialized)
        ));
        assert!(phone.current_call().await.is_none());
    }
}
