/// 基于 rsipstack 的 SIP 引擎
///
/// 负责端点、传输层与对话层的创建，注册任务的管理，以及呼叫的发起与挂断
use super::registration::RegistrationWorker;
use super::{AuthInfo, CallTarget, EngineEvent, EngineEventSender, ProxyConfig, SipEngine};
use crate::config::EngineConfig;
use crate::error::{SipError, SipResult};
use crate::sip_transport::create_udp_connection;
use crate::types::{CallId, CallState, RegistrationHandle};
use async_trait::async_trait;
use futures_util::future::join_all;
use rsip::{headers::ToTypedHeader, prelude::HeadersExt, Response, StatusCode};
use rsipstack::{
    dialog::{
        authenticate::Credential,
        client_dialog::ClientInviteDialog,
        dialog::{DialogState, DialogStateReceiver},
        dialog_layer::DialogLayer,
        invitation::{InviteAsyncResult, InviteOption},
    },
    transaction::Endpoint,
    transport::TransportLayer,
    EndpointBuilder,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 进行中的呼叫
struct CallSlot {
    cancel_token: CancellationToken,
    /// INVITE 发出即建立的客户端对话，接通前挂断发 CANCEL，接通后发 BYE
    dialog: ClientInviteDialog,
}

/// 取消后等待 INVITE 事务结束的上限（64*T1）
const INVITE_SETTLE_TIMEOUT: Duration = Duration::from_secs(32);

type CallTable = Arc<Mutex<HashMap<CallId, CallSlot>>>;

/// 引擎启动后的运行期资源
struct Running {
    endpoint: Endpoint,
    dialog_layer: Arc<DialogLayer>,
    cancel_token: CancellationToken,
    events: EngineEventSender,
    local_ip: IpAddr,
    identities: HashMap<RegistrationHandle, RegistrationWorker>,
    calls: CallTable,
}

/// rsipstack SIP 引擎
pub struct RsipEngine {
    config: EngineConfig,
    running: Option<Running>,
}

impl RsipEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    fn running_mut(&mut self) -> SipResult<&mut Running> {
        self.running.as_mut().ok_or(SipError::NotStarted)
    }

    /// 启动传入请求处理器
    fn start_incoming_handler(
        mut incoming: rsipstack::transaction::TransactionReceiver,
        dialog_layer: Arc<DialogLayer>,
        events: EngineEventSender,
        cancel_token: CancellationToken,
    ) {
        tokio::spawn(async move {
            while let Some(mut transaction) = tokio::select! {
                tx = incoming.recv() => tx,
                _ = cancel_token.cancelled() => None,
            } {
                let method = transaction.original.method;
                debug!("收到传入请求: {}", method);

                if let Some(mut dialog) = dialog_layer.match_dialog(&transaction) {
                    tokio::spawn(async move {
                        if let Err(e) = dialog.handle(&mut transaction).await {
                            error!("处理 {} 请求失败: {}", method, e);
                        }
                    });
                } else if method == rsip::Method::Message {
                    let from = transaction
                        .original
                        .from_header()
                        .ok()
                        .and_then(|header| header.typed().ok())
                        .map(|from| from.uri.to_string())
                        .unwrap_or_default();
                    let body = String::from_utf8_lossy(&transaction.original.body).to_string();

                    if let Err(e) = transaction.reply(StatusCode::OK).await {
                        warn!("应答 MESSAGE 失败: {}", e);
                    }
                    info!("收到消息: {}", from);
                    if events.send(EngineEvent::Message { from, body }).is_err() {
                        debug!("事件通道已关闭，丢弃消息事件");
                    }
                } else {
                    warn!("未找到匹配的对话: {}", method);
                    if let Err(e) = transaction.reply(StatusCode::MethodNotAllowed).await {
                        warn!("应答 {} 失败: {}", method, e);
                    }
                }
            }
        });
    }
}

fn report_call(
    events: &EngineEventSender,
    call_id: &CallId,
    state: CallState,
    status_code: Option<u16>,
    reason: Option<String>,
) {
    let event = EngineEvent::Call {
        call_id: call_id.clone(),
        state,
        status_code,
        reason,
    };
    if events.send(event).is_err() {
        debug!("事件通道已关闭，丢弃呼叫事件: {}", call_id);
    }
}

/// 一次呼叫的跟踪任务上下文
struct InviteTask {
    dialog: ClientInviteDialog,
    call_id: CallId,
    calls: CallTable,
    events: EngineEventSender,
    cancel_token: CancellationToken,
}

fn is_success(response: &Response) -> bool {
    (200..300).contains(&response.status_code.code())
}

/// 等待 INVITE 的最终响应并跟踪对话直到结束
async fn run_invite(
    task: InviteTask,
    mut invite: JoinHandle<InviteAsyncResult>,
    mut state_receiver: DialogStateReceiver,
) {
    let InviteTask {
        dialog,
        call_id,
        calls,
        events,
        cancel_token,
    } = task;

    let outcome = tokio::select! {
        result = &mut invite => Some(result),
        _ = cancel_token.cancelled() => None,
    };
    let Some(outcome) = outcome else {
        info!("呼叫在应答前被取消: {}", call_id);
        calls.lock().await.remove(&call_id);
        report_call(
            &events,
            &call_id,
            CallState::Terminated,
            None,
            Some("cancelled".to_string()),
        );
        // CANCEL 与 200 OK 交叉时，接通的对话需要补发 BYE
        let settled = tokio::time::timeout(INVITE_SETTLE_TIMEOUT, invite).await;
        if let Ok(Ok(Ok((_, Some(response))))) = settled {
            if is_success(&response) {
                hangup_dialog(&call_id, &dialog).await;
            }
        }
        return;
    };

    match outcome {
        Ok(Ok((_, Some(response)))) if is_success(&response) && cancel_token.is_cancelled() => {
            info!("呼叫接通时已被挂断: {}", call_id);
            hangup_dialog(&call_id, &dialog).await;
            return;
        }
        Ok(Ok((dialog_id, Some(response)))) if is_success(&response) => {
            info!(
                "✅ 呼叫已接通 {} -> Call-ID: {} From-Tag: {} To-Tag: {}",
                response.status_code, dialog_id.call_id, dialog_id.local_tag, dialog_id.remote_tag
            );
            report_call(
                &events,
                &call_id,
                CallState::Active,
                Some(response.status_code.code()),
                None,
            );
        }
        Ok(Ok((_, response))) => {
            let status_code = response.as_ref().map(|r| r.status_code.code());
            let reason = response.map(|r| r.status_code.to_string());
            warn!("呼叫未接通: {} {:?}", call_id, reason);
            calls.lock().await.remove(&call_id);
            report_call(&events, &call_id, CallState::Terminated, status_code, reason);
            return;
        }
        Ok(Err(e)) => {
            error!("呼叫失败: {} {}", call_id, e);
            calls.lock().await.remove(&call_id);
            report_call(&events, &call_id, CallState::Terminated, None, Some(e.to_string()));
            return;
        }
        Err(e) => {
            error!("呼叫任务异常退出: {} {}", call_id, e);
            calls.lock().await.remove(&call_id);
            report_call(&events, &call_id, CallState::Terminated, None, Some(e.to_string()));
            return;
        }
    }

    loop {
        tokio::select! {
            state = state_receiver.recv() => match state {
                Some(DialogState::Terminated(_, reason)) => {
                    info!("通话结束: {} {:?}", call_id, reason);
                    calls.lock().await.remove(&call_id);
                    report_call(
                        &events,
                        &call_id,
                        CallState::Terminated,
                        None,
                        Some(format!("{:?}", reason)),
                    );
                    break;
                }
                Some(_) => continue,
                None => break,
            },
            _ = cancel_token.cancelled() => break,
        }
    }
}

async fn hangup_dialog(call_id: &CallId, dialog: &ClientInviteDialog) {
    match dialog.hangup().await {
        Ok(()) => info!("已挂断: {}", call_id),
        Err(e) => warn!("挂断失败: {} {}", call_id, e),
    }
}

async fn hangup_slot(call_id: CallId, slot: CallSlot) {
    slot.cancel_token.cancel();
    hangup_dialog(&call_id, &slot.dialog).await;
}

#[async_trait]
impl SipEngine for RsipEngine {
    async fn start(&mut self, events: EngineEventSender) -> SipResult<()> {
        if self.running.is_some() {
            return Err(SipError::AlreadyStarted);
        }
        let cancel_token = CancellationToken::new();

        // 获取本地IP
        let local_ip = match self.config.local_ip {
            Some(ip) => ip,
            None => crate::utils::get_first_non_loopback_interface()
                .map_err(|e| SipError::Transport(e.to_string()))?,
        };
        info!(
            "检测到本地出口IP: {} ({})",
            local_ip,
            if local_ip.is_ipv6() { "IPv6" } else { "IPv4" }
        );

        // 创建传输层
        let transport_layer = TransportLayer::new(cancel_token.clone());
        let local_addr = SocketAddr::new(local_ip, self.config.local_port);
        let connection = create_udp_connection(local_addr, cancel_token.clone()).await?;
        transport_layer.add_transport(connection);

        // 创建端点
        let mut endpoint_builder = EndpointBuilder::new();
        endpoint_builder
            .with_cancel_token(cancel_token.clone())
            .with_transport_layer(transport_layer)
            .with_user_agent(&self.config.user_agent);

        let endpoint = endpoint_builder.build();

        // 启动端点服务
        let endpoint_for_serve = endpoint.inner.clone();
        tokio::spawn(async move {
            endpoint_for_serve.serve().await.ok();
        });

        // 创建对话层
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));

        Self::start_incoming_handler(
            endpoint.incoming_transactions()?,
            dialog_layer.clone(),
            events.clone(),
            cancel_token.clone(),
        );

        info!("SIP 引擎已启动, User-Agent: {}", self.config.user_agent);

        self.running = Some(Running {
            endpoint,
            dialog_layer,
            cancel_token,
            events,
            local_ip,
            identities: HashMap::new(),
            calls: Arc::new(Mutex::new(HashMap::new())),
        });
        Ok(())
    }

    async fn clear_identities(&mut self) -> SipResult<()> {
        let running = self.running_mut()?;
        let workers: Vec<RegistrationWorker> =
            running.identities.drain().map(|(_, worker)| worker).collect();
        if !workers.is_empty() {
            info!("清除 {} 个已有身份", workers.len());
        }
        join_all(workers.into_iter().map(RegistrationWorker::stop)).await;
        Ok(())
    }

    async fn add_identity(&mut self, auth: AuthInfo, proxy: ProxyConfig) -> SipResult<()> {
        let running = self.running_mut()?;
        if let Some(previous) = running.identities.remove(&proxy.handle) {
            previous.stop().await;
        }

        info!("添加身份: {} via {}", proxy.identity, proxy.server);
        let handle = proxy.handle.clone();
        let worker = RegistrationWorker::spawn(
            running.endpoint.inner.clone(),
            auth,
            proxy,
            running.events.clone(),
            &running.cancel_token,
        )?;
        running.identities.insert(handle, worker);
        Ok(())
    }

    async fn remove_identity(&mut self, handle: &RegistrationHandle) -> SipResult<()> {
        let running = self.running_mut()?;
        match running.identities.remove(handle) {
            Some(worker) => {
                info!("移除身份: {}", worker.proxy().identity);
                worker.stop().await;
            }
            None => debug!("身份不存在: {}", handle),
        }
        Ok(())
    }

    fn is_network_reachable(&self) -> bool {
        self.config.local_ip.is_some() || crate::utils::get_first_non_loopback_interface().is_ok()
    }

    async fn invite(&mut self, call_id: &CallId, target: &CallTarget) -> SipResult<()> {
        let audio_port = self.config.audio_port;
        let video_port = target.video.then_some(self.config.video_port);
        let running = self.running_mut()?;

        let actual_local_addr = running
            .endpoint
            .get_addrs()
            .first()
            .ok_or(SipError::NotStarted)?
            .addr
            .clone();

        // 单一活动身份
        let identity = running.identities.values().next();
        let (from_uri, username, credential) = match identity {
            Some(worker) => {
                let auth = worker.auth();
                let credential = Credential {
                    username: auth.username.clone(),
                    password: auth.password.clone(),
                    realm: auth.realm.clone(),
                };
                (worker.proxy().identity.clone(), auth.username.clone(), Some(credential))
            }
            None => (
                format!("sip:anonymous@{}", running.local_ip),
                "anonymous".to_string(),
                None,
            ),
        };
        let contact_uri = format!("sip:{}@{}", username, actual_local_addr);
        let to_uri = target.uri();

        info!("📞发起呼叫 源：{} -> 目标：{} (video: {})", from_uri, to_uri, target.video);

        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let sdp_offer = crate::sdp::build_offer(running.local_ip, session_id, audio_port, video_port);

        let invite_opt = InviteOption {
            caller: from_uri.as_str().try_into()?,
            callee: to_uri.as_str().try_into()?,
            contact: contact_uri.as_str().try_into()?,
            credential,
            caller_display_name: None,
            caller_params: vec![],
            destination: None,
            content_type: Some("application/sdp".to_string()),
            offer: Some(sdp_offer.into_bytes()),
            headers: None,
            support_prack: false,
            call_id: Some(call_id.to_string()),
        };

        let (state_sender, state_receiver) = running.dialog_layer.new_dialog_state_channel();
        let (dialog, invite) = running
            .dialog_layer
            .do_invite_async(invite_opt, state_sender)?;
        let cancel_token = running.cancel_token.child_token();
        running.calls.lock().await.insert(
            call_id.clone(),
            CallSlot {
                cancel_token: cancel_token.clone(),
                dialog: dialog.clone(),
            },
        );

        let task = InviteTask {
            dialog,
            call_id: call_id.clone(),
            calls: running.calls.clone(),
            events: running.events.clone(),
            cancel_token,
        };
        tokio::spawn(run_invite(task, invite, state_receiver));
        Ok(())
    }

    async fn terminate_call(&mut self, call_id: &CallId) -> SipResult<()> {
        let running = self.running_mut()?;
        let slot = running.calls.lock().await.remove(call_id);
        match slot {
            Some(slot) => hangup_slot(call_id.clone(), slot).await,
            None => debug!("呼叫已结束: {}", call_id),
        }
        Ok(())
    }

    async fn terminate_all_calls(&mut self) -> SipResult<()> {
        let running = self.running_mut()?;
        let slots: Vec<(CallId, CallSlot)> = running.calls.lock().await.drain().collect();
        if !slots.is_empty() {
            info!("挂断全部 {} 路呼叫", slots.len());
        }
        join_all(slots.into_iter().map(|(call_id, slot)| hangup_slot(call_id, slot))).await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.running.is_none() {
            return;
        }
        if let Err(e) = self.terminate_all_calls().await {
            warn!("关闭时挂断失败: {}", e);
        }
        if let Err(e) = self.clear_identities().await {
            warn!("关闭时注销失败: {}", e);
        }
        if let Some(running) = self.running.take() {
            running.cancel_token.cancel();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        info!("SIP 引擎已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineEventReceiver;
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    /// 在回环地址上启动引擎，返回引擎、事件接收端和引擎的 SIP 地址
    async fn loopback_engine() -> (RsipEngine, EngineEventReceiver, SocketAddr) {
        let config = EngineConfig {
            local_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..EngineConfig::default()
        };
        let mut engine = RsipEngine::new(config);
        let (sender, receiver) = mpsc::unbounded_channel();
        engine.start(sender).await.unwrap();
        assert!(engine.is_network_reachable());

        let addr = engine.running.as_ref().unwrap().endpoint.get_addrs()[0]
            .addr
            .to_string()
            .parse()
            .unwrap();
        (engine, receiver, addr)
    }

    async fn peer_socket() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_text(socket: &UdpSocket) -> (String, SocketAddr) {
        let mut buf = vec![0u8; 8192];
        let (len, from) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .expect("no SIP message within timeout")
            .unwrap();
        (String::from_utf8_lossy(&buf[..len]).to_string(), from)
    }

    /// 读取直到收到指定方法的请求（忽略 UDP 重传和 ACK）
    async fn recv_request(socket: &UdpSocket, method: &str) -> (String, SocketAddr) {
        loop {
            let (text, from) = recv_text(socket).await;
            if text.starts_with(&format!("{} ", method)) {
                return (text, from);
            }
        }
    }

    async fn next_engine_event(events: &mut EngineEventReceiver) -> EngineEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("no engine event within timeout")
            .expect("engine event channel closed")
    }

    fn out_of_dialog_request(
        method: &str,
        peer: SocketAddr,
        engine: SocketAddr,
        branch: &str,
        body: &str,
    ) -> String {
        format!(
            "{method} sip:1001@{engine} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {peer};branch={branch};rport\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:1002@{peer}>;tag=peer-tag\r\n\
             To: <sip:1001@{engine}>\r\n\
             Call-ID: {branch}@127.0.0.1\r\n\
             CSeq: 1 {method}\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {len}\r\n\r\n{body}",
            len = body.len()
        )
    }

    /// 按 INVITE 构造被叫侧响应
    fn reply_to(request: &str, status_code: StatusCode) -> String {
        let request = rsip::Request::try_from(request.as_bytes()).unwrap();
        let mut headers: Vec<rsip::Header> = request
            .headers
            .iter()
            .filter_map(|header| match header {
                rsip::Header::Via(_)
                | rsip::Header::From(_)
                | rsip::Header::CallId(_)
                | rsip::Header::CSeq(_) => Some(header.clone()),
                rsip::Header::To(to) => Some(rsip::Header::To(
                    to.clone()
                        .with_tag(rsip::param::Tag::new("callee"))
                        .unwrap(),
                )),
                _ => None,
            })
            .collect();
        headers.push(rsip::Header::ContentLength(0u32.into()));
        rsip::Response {
            status_code,
            version: rsip::Version::V2,
            headers: headers.into(),
            body: vec![],
        }
        .to_string()
    }

    #[tokio::test]
    async fn test_out_of_dialog_message_is_accepted_and_reported() {
        let (mut engine, mut events, engine_addr) = loopback_engine().await;
        let (peer, peer_addr) = peer_socket().await;

        let message =
            out_of_dialog_request("MESSAGE", peer_addr, engine_addr, "z9hG4bKmsg1", "hello");
        peer.send_to(message.as_bytes(), engine_addr).await.unwrap();

        let (reply, _) = recv_text(&peer).await;
        assert!(reply.starts_with("SIP/2.0 200"), "unexpected reply: {}", reply);

        match next_engine_event(&mut events).await {
            EngineEvent::Message { from, body } => {
                assert!(from.contains("1002"), "unexpected sender: {}", from);
                assert_eq!(body, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_other_out_of_dialog_request_is_rejected() {
        let (mut engine, _events, engine_addr) = loopback_engine().await;
        let (peer, peer_addr) = peer_socket().await;

        let options = out_of_dialog_request("OPTIONS", peer_addr, engine_addr, "z9hG4bKopt1", "");
        peer.send_to(options.as_bytes(), engine_addr).await.unwrap();

        let (reply, _) = recv_text(&peer).await;
        assert!(reply.starts_with("SIP/2.0 405"), "unexpected reply: {}", reply);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_invite_reports_final_status() {
        let (mut engine, mut events, _) = loopback_engine().await;
        let (peer, peer_addr) = peer_socket().await;

        let call_id = CallId::generate();
        let target = CallTarget::new("1002", "127.0.0.1", peer_addr.port(), false).unwrap();
        engine.invite(&call_id, &target).await.unwrap();

        let (invite, from) = recv_request(&peer, "INVITE").await;
        assert!(invite.contains("application/sdp"));
        let busy = reply_to(&invite, StatusCode::BusyHere);
        peer.send_to(busy.as_bytes(), from).await.unwrap();

        match next_engine_event(&mut events).await {
            EngineEvent::Call {
                call_id: reported,
                state,
                status_code,
                ..
            } => {
                assert_eq!(reported, call_id);
                assert_eq!(state, CallState::Terminated);
                assert_eq!(status_code, Some(486));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_hangup_before_answer_sends_cancel() {
        let (mut engine, _events, _) = loopback_engine().await;
        let (peer, peer_addr) = peer_socket().await;

        let call_id = CallId::generate();
        let target = CallTarget::new("1002", "127.0.0.1", peer_addr.port(), false).unwrap();
        engine.invite(&call_id, &target).await.unwrap();

        let (invite, from) = recv_request(&peer, "INVITE").await;
        let ringing = reply_to(&invite, StatusCode::Ringing);
        peer.send_to(ringing.as_bytes(), from).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        engine.terminate_call(&call_id).await.unwrap();

        let (cancel, _) = recv_request(&peer, "CANCEL").await;
        assert!(cancel.contains(call_id.as_str()));
        assert!(engine.running.as_ref().unwrap().calls.lock().await.is_empty());
        engine.shutdown().await;
    }
}
