/// 会话登记表
///
/// 按注册句柄保存身份，并跟踪当前唯一的呼叫会话
use crate::engine::{AuthInfo, ProxyConfig};
use crate::types::{CallId, CallState, RegistrationHandle, RegistrationState};
use std::collections::HashMap;

/// 一个注册身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEntry {
    pub handle: RegistrationHandle,
    pub domain: String,
    pub port: u16,
    pub username: String,
    pub credential: AuthInfo,
    pub proxy: ProxyConfig,
    pub state: RegistrationState,
}

/// 当前呼叫
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: CallId,
    pub remote_uri: String,
    pub video: bool,
    pub state: CallState,
}

impl CallSession {
    pub fn new(remote_uri: String, video: bool) -> Self {
        Self {
            id: CallId::generate(),
            remote_uri,
            video,
            state: CallState::Idle,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<RegistrationHandle, RegistrationEntry>,
    current_call: Option<CallSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入身份，同一句柄已有记录时替换并返回旧记录
    pub fn insert(&mut self, entry: RegistrationEntry) -> Option<RegistrationEntry> {
        self.entries.insert(entry.handle.clone(), entry)
    }

    pub fn remove(&mut self, handle: &RegistrationHandle) -> Option<RegistrationEntry> {
        self.entries.remove(handle)
    }

    pub fn get(&self, handle: &RegistrationHandle) -> Option<&RegistrationEntry> {
        self.entries.get(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 取出全部身份
    pub fn drain(&mut self) -> Vec<RegistrationEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    /// 当前活动身份（同一时刻只保留一个）
    pub fn active_identity(&self) -> Option<&RegistrationEntry> {
        self.entries.values().next()
    }

    /// 更新注册状态，返回 (迁移前状态, 更新后的记录)
    ///
    /// 未知句柄、代次不符或非法迁移返回 None
    pub fn update_registration(
        &mut self,
        handle: &RegistrationHandle,
        generation: u64,
        state: RegistrationState,
    ) -> Option<(RegistrationState, RegistrationEntry)> {
        let entry = self
            .entries
            .get_mut(handle)
            .filter(|entry| entry.proxy.generation == generation)?;
        let previous = entry.state;
        if !previous.can_transition_to(state) {
            return None;
        }
        entry.state = state;
        Some((previous, entry.clone()))
    }

    pub fn current_call(&self) -> Option<&CallSession> {
        self.current_call.as_ref()
    }

    /// 当前仍在进行的呼叫
    pub fn call_in_progress(&self) -> Option<&CallSession> {
        self.current_call
            .as_ref()
            .filter(|call| call.state.is_in_progress())
    }

    /// 设置新的当前呼叫，返回被替换的旧呼叫
    pub fn replace_call(&mut self, session: CallSession) -> Option<CallSession> {
        self.current_call.replace(session)
    }

    /// 更新当前呼叫状态，呼叫标识不匹配或迁移非法返回 None
    pub fn update_call(
        &mut self,
        call_id: &CallId,
        state: CallState,
    ) -> Option<(CallState, CallSession)> {
        let call = self.current_call.as_mut().filter(|call| &call.id == call_id)?;
        let previous = call.state;
        if !previous.can_transition_to(state) {
            return None;
        }
        call.state = state;
        Some((previous, call.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Account;

    fn entry(handle: &str, username: &str, generation: u64) -> RegistrationEntry {
        let account = Account::new("pbx.example.com", username, "pw").unwrap();
        let handle = RegistrationHandle::new(handle);
        RegistrationEntry {
            handle: handle.clone(),
            domain: account.server_host.clone(),
            port: account.sip_port,
            username: account.username.clone(),
            credential: account.auth_info(),
            proxy: account.proxy_config(handle, generation, 3600),
            state: RegistrationState::Registering,
        }
    }

    #[test]
    fn test_one_entry_per_handle() {
        let mut registry = SessionRegistry::new();
        assert!(registry.insert(entry("h1", "1001", 1)).is_none());
        let replaced = registry.insert(entry("h1", "1002", 2));
        assert_eq!(replaced.map(|e| e.username), Some("1001".to_string()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&"h1".into()).unwrap().username, "1002");
    }

    #[test]
    fn test_registration_updates() {
        let mut registry = SessionRegistry::new();
        registry.insert(entry("h1", "1001", 1));
        let handle = RegistrationHandle::new("h1");

        let (previous, updated) = registry
            .update_registration(&handle, 1, RegistrationState::Registered)
            .unwrap();
        assert_eq!(previous, RegistrationState::Registering);
        assert_eq!(updated.state, RegistrationState::Registered);

        // 重复状态不产生迁移
        assert!(registry
            .update_registration(&handle, 1, RegistrationState::Registered)
            .is_none());
        assert!(registry
            .update_registration(&"unknown".into(), 1, RegistrationState::Registered)
            .is_none());
    }

    #[test]
    fn test_reused_handle_ignores_old_generation() {
        let mut registry = SessionRegistry::new();
        registry.insert(entry("h1", "1001", 1));
        registry.insert(entry("h1", "1001", 2));
        let handle = RegistrationHandle::new("h1");

        assert!(registry
            .update_registration(&handle, 1, RegistrationState::RegistrationFailed)
            .is_none());
        assert_eq!(registry.get(&handle).unwrap().state, RegistrationState::Registering);

        let (_, updated) = registry
            .update_registration(&handle, 2, RegistrationState::Registered)
            .unwrap();
        assert_eq!(updated.state, RegistrationState::Registered);
    }

    #[test]
    fn test_call_updates_only_apply_to_current_call() {
        let mut registry = SessionRegistry::new();
        let first = CallSession::new("sip:1002@pbx".to_string(), false);
        let first_id = first.id.clone();
        registry.replace_call(first);
        registry.update_call(&first_id, CallState::Inviting).unwrap();
        assert!(registry.call_in_progress().is_some());

        let second = CallSession::new("sip:1003@pbx".to_string(), true);
        let second_id = second.id.clone();
        let replaced = registry.replace_call(second).unwrap();
        assert_eq!(replaced.id, first_id);

        assert!(registry.update_call(&first_id, CallState::Active).is_none());
        assert!(registry.call_in_progress().is_none());

        registry.update_call(&second_id, CallState::Inviting).unwrap();
        let (previous, call) = registry.update_call(&second_id, CallState::Active).unwrap();
        assert_eq!(previous, CallState::Inviting);
        assert_eq!(call.state, CallState::Active);
        assert!(call.video);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = SessionRegistry::new();
        registry.insert(entry("h1", "1001", 1));
        registry.insert(entry("h2", "1002", 2));
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.active_identity().is_none());
    }
}
