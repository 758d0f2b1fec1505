/// 测试用的记录型引擎
use super::{AuthInfo, CallTarget, EngineEvent, EngineEventSender, ProxyConfig, SipEngine};
use crate::error::{SipError, SipResult};
use crate::types::{CallId, RegistrationHandle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// 引擎收到的调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineCall {
    Start,
    ClearIdentities,
    AddIdentity(AuthInfo, ProxyConfig),
    RemoveIdentity(RegistrationHandle),
    Invite(CallId, CallTarget),
    TerminateCall(CallId),
    TerminateAllCalls,
    Shutdown,
}

/// 可在测试中共享的引擎探针
#[derive(Clone, Default)]
pub(crate) struct MockRecorder {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    identities: Arc<Mutex<Vec<ProxyConfig>>>,
    events: Arc<Mutex<Option<EngineEventSender>>>,
    unreachable: Arc<AtomicBool>,
}

impl MockRecorder {
    pub(crate) fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn identities(&self) -> Vec<ProxyConfig> {
        self.identities.lock().unwrap().clone()
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// 模拟引擎上报
    pub(crate) fn emit(&self, event: EngineEvent) {
        let events = self.events.lock().unwrap();
        events.as_ref().unwrap().send(event).unwrap();
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }
}

pub(crate) struct MockEngine {
    recorder: MockRecorder,
    started: bool,
}

impl MockEngine {
    pub(crate) fn new() -> (Self, MockRecorder) {
        let recorder = MockRecorder::default();
        (
            Self {
                recorder: recorder.clone(),
                started: false,
            },
            recorder,
        )
    }
}

#[async_trait]
impl SipEngine for MockEngine {
    async fn start(&mut self, events: EngineEventSender) -> SipResult<()> {
        if self.started {
            return Err(SipError::AlreadyStarted);
        }
        self.started = true;
        *self.recorder.events.lock().unwrap() = Some(events);
        self.recorder.record(EngineCall::Start);
        Ok(())
    }

    async fn clear_identities(&mut self) -> SipResult<()> {
        self.recorder.identities.lock().unwrap().clear();
        self.recorder.record(EngineCall::ClearIdentities);
        Ok(())
    }

    async fn add_identity(&mut self, auth: AuthInfo, proxy: ProxyConfig) -> SipResult<()> {
        self.recorder.identities.lock().unwrap().push(proxy.clone());
        self.recorder.record(EngineCall::AddIdentity(auth, proxy));
        Ok(())
    }

    async fn remove_identity(&mut self, handle: &RegistrationHandle) -> SipResult<()> {
        self.recorder
            .identities
            .lock()
            .unwrap()
            .retain(|proxy| &proxy.handle != handle);
        self.recorder.record(EngineCall::RemoveIdentity(handle.clone()));
        Ok(())
    }

    fn is_network_reachable(&self) -> bool {
        !self.recorder.unreachable.load(Ordering::SeqCst)
    }

    async fn invite(&mut self, call_id: &CallId, target: &CallTarget) -> SipResult<()> {
        self.recorder
            .record(EngineCall::Invite(call_id.clone(), target.clone()));
        Ok(())
    }

    async fn terminate_call(&mut self, call_id: &CallId) -> SipResult<()> {
        self.recorder.record(EngineCall::TerminateCall(call_id.clone()));
        Ok(())
    }

    async fn terminate_all_calls(&mut self) -> SipResult<()> {
        self.recorder.record(EngineCall::TerminateAllCalls);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.recorder.record(EngineCall::Shutdown);
    }
}
