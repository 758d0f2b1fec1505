/// 生命周期控制器
///
/// 负责注册、注销、呼叫、挂断四类操作：
///
/// - 所有引擎操作都在引擎锁内完成，加锁顺序固定为 引擎 -> 登记表
/// - 同一时刻只保留一个身份，重复注册会先清除旧的认证信息和代理配置
/// - 发起新呼叫前先结束当前呼叫
/// - 引擎上报的状态变化由后台事件泵写回登记表并分发给订阅者
use crate::config::{Account, DEFAULT_REGISTER_EXPIRES};
use crate::engine::{CallTarget, EngineEvent, EngineEventReceiver, SipEngine};
use crate::error::{CallError, CallResult};
use crate::events::{
    CallStatusInfo, EventDispatcher, EventSink, MessageInfo, PhoneEvent, RegistrationStatusInfo,
};
use crate::registry::{CallSession, RegistrationEntry, SessionRegistry};
use crate::types::{CallId, CallState, RegistrationHandle, RegistrationState};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct LifecycleController<E: SipEngine> {
    engine: Mutex<E>,
    registry: Arc<Mutex<SessionRegistry>>,
    dispatcher: Arc<EventDispatcher>,
    register_expires: u32,
    /// 注册代次计数，每次注册递增
    generation: AtomicU64,
    initialized: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn registration_event(
    entry: &RegistrationEntry,
    previous_state: RegistrationState,
    status_code: Option<u16>,
    reason: Option<String>,
) -> PhoneEvent {
    PhoneEvent::RegistrationStateChanged(RegistrationStatusInfo {
        handle: entry.handle.clone(),
        username: entry.username.clone(),
        domain: entry.domain.clone(),
        previous_state,
        state: entry.state,
        status_code,
        reason,
    })
}

fn call_event(
    call: &CallSession,
    previous_state: CallState,
    status_code: Option<u16>,
    reason: Option<String>,
) -> PhoneEvent {
    PhoneEvent::CallStateChanged(CallStatusInfo {
        call_id: call.id.clone(),
        remote_uri: call.remote_uri.clone(),
        video: call.video,
        previous_state,
        state: call.state,
        status_code,
        reason,
    })
}

/// 把引擎上报写回登记表，返回需要分发的事件
async fn apply_engine_event(
    registry: &Mutex<SessionRegistry>,
    event: EngineEvent,
) -> Option<PhoneEvent> {
    match event {
        EngineEvent::Registration {
            handle,
            generation,
            state,
            status_code,
            reason,
        } => {
            let transition = registry
                .lock()
                .await
                .update_registration(&handle, generation, state);
            match transition {
                Some((previous, entry)) => {
                    Some(registration_event(&entry, previous, status_code, reason))
                }
                None => {
                    debug!("忽略过期的注册上报: {}#{} {}", handle, generation, state);
                    None
                }
            }
        }
        EngineEvent::Call {
            call_id,
            state,
            status_code,
            reason,
        } => {
            let transition = registry.lock().await.update_call(&call_id, state);
            match transition {
                Some((previous, call)) => Some(call_event(&call, previous, status_code, reason)),
                None => {
                    debug!("忽略过期的呼叫上报: {} {}", call_id, state);
                    None
                }
            }
        }
        EngineEvent::Message { from, body } => {
            Some(PhoneEvent::MessageReceived(MessageInfo { from, body }))
        }
    }
}

async fn run_event_pump(
    mut events: EngineEventReceiver,
    registry: Arc<Mutex<SessionRegistry>>,
    dispatcher: Arc<EventDispatcher>,
) {
    while let Some(event) = events.recv().await {
        if let Some(phone_event) = apply_engine_event(&registry, event).await {
            dispatcher.dispatch(phone_event).await;
        }
    }
    debug!("引擎事件通道已关闭");
}

impl<E: SipEngine> LifecycleController<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Mutex::new(engine),
            registry: Arc::new(Mutex::new(SessionRegistry::new())),
            dispatcher: Arc::new(EventDispatcher::default()),
            register_expires: DEFAULT_REGISTER_EXPIRES,
            generation: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    /// 设置注册有效期（秒）
    pub fn with_register_expires(mut self, expires: u32) -> Self {
        self.register_expires = expires;
        self
    }

    /// 订阅话机事件
    pub async fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.dispatcher.subscribe(sink).await;
    }

    fn ensure_initialized(&self) -> CallResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CallError::NotInitialized)
        }
    }

    /// 启动引擎和事件泵，重复调用无副作用
    pub async fn init(&self) -> CallResult<()> {
        let mut engine = self.engine.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            debug!("话机已初始化");
            return Ok(());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        engine.start(sender).await?;

        let pump = tokio::spawn(run_event_pump(
            receiver,
            self.registry.clone(),
            self.dispatcher.clone(),
        ));
        *self.pump.lock().await = Some(pump);
        self.initialized.store(true, Ordering::SeqCst);
        info!("话机初始化完成");
        Ok(())
    }

    async fn move_registration(
        &self,
        handle: &RegistrationHandle,
        generation: u64,
        state: RegistrationState,
        reason: Option<String>,
    ) {
        let transition = self
            .registry
            .lock()
            .await
            .update_registration(handle, generation, state);
        if let Some((previous, entry)) = transition {
            self.dispatcher
                .dispatch(registration_event(&entry, previous, None, reason))
                .await;
        }
    }

    async fn move_call(&self, call_id: &CallId, state: CallState, reason: Option<String>) {
        let transition = self.registry.lock().await.update_call(call_id, state);
        if let Some((previous, call)) = transition {
            self.dispatcher
                .dispatch(call_event(&call, previous, None, reason))
                .await;
        }
    }

    /// 通知身份已注销（记录已从登记表移除）
    async fn announce_unregistered(&self, mut entry: RegistrationEntry, reason: Option<String>) {
        let previous = entry.state;
        if !previous.can_transition_to(RegistrationState::Unregistered) {
            return;
        }
        entry.state = RegistrationState::Unregistered;
        self.dispatcher
            .dispatch(registration_event(&entry, previous, None, reason))
            .await;
    }

    /// 用配置串 `服务器,用户名,密码,端口` 注册
    ///
    /// 配置串格式错误时直接返回错误，不会触发任何引擎调用
    pub async fn register_with_config(
        &self,
        handle: RegistrationHandle,
        config: &str,
    ) -> CallResult<RegistrationHandle> {
        let account = Account::from_config_str(config)?;
        self.register(handle, account).await
    }

    /// 注册身份
    ///
    /// 先清除引擎中已有的认证信息与代理配置，再创建新的；注册结果通过事件上报
    pub async fn register(
        &self,
        handle: RegistrationHandle,
        account: Account,
    ) -> CallResult<RegistrationHandle> {
        let mut engine = self.engine.lock().await;
        self.ensure_initialized()?;

        info!("注册身份: {} ({})", account.identity_uri(), handle);

        engine.clear_identities().await?;
        let replaced = self.registry.lock().await.drain();
        for entry in replaced {
            info!("替换已有身份: {}", entry.handle);
            self.announce_unregistered(entry, Some("replaced".to_string()))
                .await;
        }

        let auth = account.auth_info();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let proxy = account.proxy_config(handle.clone(), generation, self.register_expires);
        let entry = RegistrationEntry {
            handle: handle.clone(),
            domain: account.server_host.clone(),
            port: account.sip_port,
            username: account.username.clone(),
            credential: auth.clone(),
            proxy: proxy.clone(),
            state: RegistrationState::Unregistered,
        };
        self.registry.lock().await.insert(entry);
        self.move_registration(&handle, generation, RegistrationState::Registering, None)
            .await;

        if let Err(e) = engine.add_identity(auth, proxy).await {
            error!("添加身份失败: {} {}", handle, e);
            self.move_registration(
                &handle,
                generation,
                RegistrationState::RegistrationFailed,
                Some(e.to_string()),
            )
            .await;
            return Err(e.into());
        }
        Ok(handle)
    }

    /// 注销身份，未知句柄直接返回
    pub async fn unregister(&self, handle: &RegistrationHandle) -> CallResult<()> {
        let mut engine = self.engine.lock().await;

        let removed = self.registry.lock().await.remove(handle);
        let Some(entry) = removed else {
            debug!("注销未知句柄，忽略: {}", handle);
            return Ok(());
        };

        info!("注销身份: {} ({})", entry.proxy.identity, handle);
        let result = engine.remove_identity(handle).await;
        self.announce_unregistered(entry, None).await;
        result.map_err(CallError::from)
    }

    /// 发起呼叫
    ///
    /// 返回新呼叫的标识；被叫为本机身份时不发起呼叫，返回 `None`
    pub async fn call(&self, target: CallTarget) -> CallResult<Option<CallId>> {
        let mut engine = self.engine.lock().await;
        self.ensure_initialized()?;

        if !engine.is_network_reachable() {
            error!("网络不可达，无法呼叫 {}", target.number);
            return Err(CallError::NetworkUnreachable);
        }

        // 先结束当前呼叫
        let in_progress = self
            .registry
            .lock()
            .await
            .call_in_progress()
            .map(|call| call.id.clone());
        if let Some(call_id) = in_progress {
            info!("结束当前呼叫: {}", call_id);
            engine.terminate_call(&call_id).await?;
            self.move_call(&call_id, CallState::Terminated, Some("replaced".to_string()))
                .await;
        }

        let identity = self
            .registry
            .lock()
            .await
            .active_identity()
            .map(|entry| (entry.username.clone(), entry.domain.clone(), entry.port));

        let target = match identity {
            Some((username, domain, port)) => {
                if target.user() == username {
                    info!("被叫 {} 为本机身份，不发起呼叫", target.number);
                    return Ok(None);
                }
                target.with_default_host(&domain, port)
            }
            None => target,
        };
        if target.host.is_empty() && !target.number.contains('@') {
            warn!("未注册且未指定被叫主机: {}", target.number);
            return Err(CallError::invalid_target(target.number));
        }

        let session = CallSession::new(target.uri(), target.video);
        let call_id = session.id.clone();
        self.registry.lock().await.replace_call(session);
        self.move_call(&call_id, CallState::Inviting, None).await;

        if let Err(e) = engine.invite(&call_id, &target).await {
            error!("发起呼叫失败: {} {}", call_id, e);
            self.move_call(&call_id, CallState::Terminated, Some(e.to_string()))
                .await;
            return Err(e.into());
        }
        Ok(Some(call_id))
    }

    /// 挂断全部呼叫
    pub async fn hangup_all(&self) -> CallResult<()> {
        let mut engine = self.engine.lock().await;
        self.ensure_initialized()?;

        engine.terminate_all_calls().await?;
        let in_progress = self
            .registry
            .lock()
            .await
            .call_in_progress()
            .map(|call| call.id.clone());
        if let Some(call_id) = in_progress {
            self.move_call(&call_id, CallState::Terminated, Some("hangup".to_string()))
                .await;
        }
        Ok(())
    }

    pub async fn registration_state(&self, handle: &RegistrationHandle) -> Option<RegistrationState> {
        self.registry.lock().await.get(handle).map(|entry| entry.state)
    }

    pub async fn current_call(&self) -> Option<CallSession> {
        self.registry.lock().await.current_call().cloned()
    }

    /// 挂断、注销全部身份并关闭引擎
    pub async fn shutdown(&self) {
        let mut engine = self.engine.lock().await;
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = engine.terminate_all_calls().await {
            warn!("关闭时挂断失败: {}", e);
        }
        let in_progress = self
            .registry
            .lock()
            .await
            .call_in_progress()
            .map(|call| call.id.clone());
        if let Some(call_id) = in_progress {
            self.move_call(&call_id, CallState::Terminated, Some("shutdown".to_string()))
                .await;
        }

        if let Err(e) = engine.clear_identities().await {
            warn!("关闭时注销失败: {}", e);
        }
        let entries = self.registry.lock().await.drain();
        for entry in entries {
            self.announce_unregistered(entry, Some("shutdown".to_string()))
                .await;
        }

        engine.shutdown().await;
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        info!("话机已关闭");
    }
}
