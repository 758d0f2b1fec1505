/// 公共类型定义
///
/// 注册句柄、呼叫标识以及注册/呼叫状态机
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 注册句柄
///
/// 由调用方持有的关联ID，用于查询和注销一次注册
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationHandle(String);

impl RegistrationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 生成基于 UUID v4 的新句柄
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegistrationHandle {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// 呼叫标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    RegistrationFailed,
}

impl RegistrationState {
    /// 状态迁移是否合法（相同状态视为不迁移）
    pub fn can_transition_to(self, next: RegistrationState) -> bool {
        use RegistrationState::*;
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Registering, Registered)
                | (Registering, RegistrationFailed)
                | (Registering, Unregistered)
                | (Registered, Registering)
                | (Registered, RegistrationFailed)
                | (Registered, Unregistered)
                | (RegistrationFailed, Registering)
                | (RegistrationFailed, Unregistered)
        )
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::RegistrationFailed => "registration failed",
        };
        f.write_str(s)
    }
}

/// 呼叫状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Inviting,
    Active,
    Terminated,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Inviting) | (Inviting, Active) | (Inviting, Terminated) | (Active, Terminated)
        )
    }

    /// 呼叫是否仍在进行（未结束）
    pub fn is_in_progress(self) -> bool {
        matches!(self, CallState::Inviting | CallState::Active)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Inviting => "inviting",
            CallState::Active => "active",
            CallState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}
