/// 事件通知
///
/// 控制器把注册、呼叫、消息三类状态变化以 [`PhoneEvent`] 的形式分发给
/// 所有订阅的 [`EventSink`]。事件在后台任务上产生，UI 需要通过
/// [`ChannelSink`] 之类的通道把事件转交给持有界面状态的线程再渲染。
use crate::types::{CallId, CallState, RegistrationHandle, RegistrationState};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// 注册状态变化
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationStatusInfo {
    pub handle: RegistrationHandle,
    pub username: String,
    pub domain: String,
    pub previous_state: RegistrationState,
    pub state: RegistrationState,
    /// 引擎给出的 SIP 状态码
    pub status_code: Option<u16>,
    pub reason: Option<String>,
}

/// 呼叫状态变化
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallStatusInfo {
    pub call_id: CallId,
    pub remote_uri: String,
    pub video: bool,
    pub previous_state: CallState,
    pub state: CallState,
    pub status_code: Option<u16>,
    pub reason: Option<String>,
}

/// 收到的即时消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageInfo {
    pub from: String,
    pub body: String,
}

/// 话机事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhoneEvent {
    RegistrationStateChanged(RegistrationStatusInfo),
    CallStateChanged(CallStatusInfo),
    MessageReceived(MessageInfo),
}

impl PhoneEvent {
    /// 序列化为 JSON，供跨语言回调使用
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// 事件接收端
///
/// 在事件泵任务上被同步调用，实现不应阻塞
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &PhoneEvent);
}

/// 把事件转发到通道，由接收端所在线程处理
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<PhoneEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PhoneEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: &PhoneEvent) {
        if self.sender.send(event.clone()).is_err() {
            warn!("事件接收端已关闭");
        }
    }
}

/// 通过 tracing 记录事件
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: &PhoneEvent) {
        match event {
            PhoneEvent::RegistrationStateChanged(info) => info!(
                "注册状态: {} {} -> {} ({:?} {:?})",
                info.handle, info.previous_state, info.state, info.status_code, info.reason
            ),
            PhoneEvent::CallStateChanged(info) => info!(
                "呼叫状态: {} {} {} -> {} ({:?} {:?})",
                info.call_id,
                info.remote_uri,
                info.previous_state,
                info.state,
                info.status_code,
                info.reason
            ),
            PhoneEvent::MessageReceived(info) => info!("收到消息: {} {}", info.from, info.body),
        }
    }
}

/// 订阅者列表
#[derive(Default)]
pub(crate) struct EventDispatcher {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventDispatcher {
    pub(crate) async fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().await.push(sink);
    }

    pub(crate) async fn dispatch(&self, event: PhoneEvent) {
        for sink in self.sinks.read().await.iter() {
            sink.on_event(&event);
        }
    }
}
