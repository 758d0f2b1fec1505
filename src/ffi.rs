/// C ABI 导出
///
/// 宿主程序（桌面 UI）通过这些函数驱动话机。所有字符串均为 NUL 结尾的 UTF-8。
/// 事件以 JSON 形式交给 `SetEventCallback` 注册的回调。回调只在专用的事件线程
/// `sip-phone-events` 上执行，可以在回调里再次调用本模块的导出函数；宿主需要
/// 自行切换到 UI 线程。
use crate::config::{Account, EngineConfig};
use crate::controller::LifecycleController;
use crate::engine::{CallTarget, RsipEngine};
use crate::error::CallError;
use crate::events::{EventSink, PhoneEvent};
use crate::types::RegistrationHandle;
use once_cell::sync::{Lazy, OnceCell};
use std::ffi::{CStr, CString};
use std::future::Future;
use std::os::raw::{c_char, c_int};
use std::sync::{Arc, Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const SDK_OK: c_int = 0;
pub const SDK_ERR_NOT_INITIALIZED: c_int = -1;
pub const SDK_ERR_INVALID_ARGUMENT: c_int = -2;
pub const SDK_ERR_NETWORK: c_int = -3;
pub const SDK_ERR_ENGINE: c_int = -4;
pub const SDK_ERR_RUNTIME: c_int = -5;
/// 在 SDK 运行时线程上调用了阻塞导出
pub const SDK_ERR_REENTRANT: c_int = -6;

/// 事件回调，参数为事件 JSON，仅在回调期间有效
pub type EventCallback = extern "C" fn(*const c_char);

type Phone = Arc<LifecycleController<RsipEngine>>;

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

static PHONE: Lazy<Mutex<Option<Phone>>> = Lazy::new(|| Mutex::new(None));

static EVENT_CALLBACK: Lazy<RwLock<Option<EventCallback>>> = Lazy::new(|| RwLock::new(None));

/// 事件投递队列，由 `sip-phone-events` 线程消费
static EVENT_QUEUE: Lazy<Option<mpsc::UnboundedSender<String>>> = Lazy::new(|| {
    let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
    let spawned = std::thread::Builder::new()
        .name("sip-phone-events".to_string())
        .spawn(move || {
            while let Some(json) = receiver.blocking_recv() {
                deliver(&json);
            }
        });
    match spawned {
        Ok(_) => Some(sender),
        Err(e) => {
            error!("创建事件线程失败: {}", e);
            None
        }
    }
});

fn event_callback() -> Option<EventCallback> {
    match EVENT_CALLBACK.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn deliver(json: &str) {
    let Some(callback) = event_callback() else {
        return;
    };
    match CString::new(json) {
        Ok(json) => callback(json.as_ptr()),
        Err(e) => warn!("事件包含 NUL 字符: {}", e),
    }
}

/// 把事件转成 JSON 放入投递队列
struct CallbackSink;

impl EventSink for CallbackSink {
    fn on_event(&self, event: &PhoneEvent) {
        if event_callback().is_none() {
            return;
        }
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("事件序列化失败: {}", e);
                return;
            }
        };
        match EVENT_QUEUE.as_ref() {
            Some(queue) => {
                if queue.send(json).is_err() {
                    warn!("事件线程已退出");
                }
            }
            None => debug!("无事件线程，丢弃事件"),
        }
    }
}

fn runtime() -> Option<&'static Runtime> {
    match RUNTIME.get_or_try_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("sip-phone")
            .build()
    }) {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            error!("创建运行时失败: {}", e);
            None
        }
    }
}

/// 在 SDK 运行时上阻塞执行
///
/// 当前线程已处于 tokio 运行时中时拒绝执行，返回错误码
fn run_blocking<F: Future>(future: F) -> Result<F::Output, c_int> {
    if Handle::try_current().is_ok() {
        error!("不能在运行时线程上调用 SDK 导出函数");
        return Err(SDK_ERR_REENTRANT);
    }
    let runtime = runtime().ok_or(SDK_ERR_RUNTIME)?;
    Ok(runtime.block_on(future))
}

fn current_phone() -> Option<Phone> {
    match PHONE.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn error_status(err: &CallError) -> c_int {
    match err {
        CallError::NotInitialized => SDK_ERR_NOT_INITIALIZED,
        CallError::Config(_) | CallError::InvalidTarget { .. } => SDK_ERR_INVALID_ARGUMENT,
        CallError::NetworkUnreachable => SDK_ERR_NETWORK,
        CallError::Engine(_) => SDK_ERR_ENGINE,
    }
}

fn report_error(operation: &str, err: &CallError) -> c_int {
    error!("{} 失败 [{}]: {}", operation, err.error_code(), err);
    error_status(err)
}

/// 读取 C 字符串参数，空指针或非 UTF-8 返回 None
///
/// # Safety
/// `ptr` 为空或指向有效的 NUL 结尾字符串
unsafe fn c_str_arg(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(str::to_string)
}

fn into_c_string(value: String) -> *mut c_char {
    match CString::new(value) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// 初始化 SDK：日志、运行时、SIP 引擎。重复调用返回 0
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn InitSdk() -> c_int {
    crate::utils::initialize_logging("info");

    let mut slot = match PHONE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if slot.is_some() {
        info!("SDK 已初始化");
        return SDK_OK;
    }

    let phone = Arc::new(crate::create_phone(EngineConfig::default()));
    let result = run_blocking(async {
        phone.subscribe(Arc::new(CallbackSink)).await;
        phone.init().await
    });
    match result {
        Ok(Ok(())) => {
            *slot = Some(phone);
            info!("SDK 初始化完成, 版本 {}", crate::VERSION);
            SDK_OK
        }
        Ok(Err(e)) => report_error("InitSdk", &e),
        Err(code) => code,
    }
}

/// 注册身份，返回注册句柄；失败返回 NULL
///
/// 返回的字符串需要用 `FreeString` 释放
///
/// # Safety
/// 参数为空或指向有效的 NUL 结尾字符串
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn Register(
    domain: *const c_char,
    username: *const c_char,
    password: *const c_char,
) -> *mut c_char {
    let (Some(domain), Some(username), Some(password)) =
        (c_str_arg(domain), c_str_arg(username), c_str_arg(password))
    else {
        warn!("Register 参数无效");
        return std::ptr::null_mut();
    };
    let Some(phone) = current_phone() else {
        report_error("Register", &CallError::NotInitialized);
        return std::ptr::null_mut();
    };

    let account = match Account::new(&domain, &username, &password) {
        Ok(account) => account,
        Err(e) => {
            report_error("Register", &e.into());
            return std::ptr::null_mut();
        }
    };
    match run_blocking(phone.register(RegistrationHandle::generate(), account)) {
        Ok(Ok(handle)) => into_c_string(handle.to_string()),
        Ok(Err(e)) => {
            report_error("Register", &e);
            std::ptr::null_mut()
        }
        Err(_) => std::ptr::null_mut(),
    }
}

/// 注销身份，未知句柄返回 0
///
/// # Safety
/// `registration_id` 为空或指向有效的 NUL 结尾字符串
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn Unregistration(registration_id: *const c_char) -> c_int {
    let Some(registration_id) = c_str_arg(registration_id) else {
        return SDK_ERR_INVALID_ARGUMENT;
    };
    let Some(phone) = current_phone() else {
        return SDK_ERR_NOT_INITIALIZED;
    };

    let handle = RegistrationHandle::new(registration_id);
    match run_blocking(phone.unregister(&handle)) {
        Ok(Ok(())) => SDK_OK,
        Ok(Err(e)) => report_error("Unregistration", &e),
        Err(code) => code,
    }
}

/// 发起呼叫
///
/// `ip` 为空（或 NULL）时使用当前注册服务器，`port` 不大于 0 时不带端口
///
/// # Safety
/// 字符串参数为空或指向有效的 NUL 结尾字符串
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn CallPhone(
    sip: *const c_char,
    ip: *const c_char,
    port: c_int,
    video_enabled: bool,
) -> c_int {
    let Some(sip) = c_str_arg(sip) else {
        return SDK_ERR_INVALID_ARGUMENT;
    };
    let ip = c_str_arg(ip).unwrap_or_default();
    let Ok(port) = u16::try_from(port.max(0)) else {
        return SDK_ERR_INVALID_ARGUMENT;
    };
    let Some(phone) = current_phone() else {
        return SDK_ERR_NOT_INITIALIZED;
    };

    let target = match CallTarget::new(&sip, &ip, port, video_enabled) {
        Ok(target) => target,
        Err(e) => return report_error("CallPhone", &e.into()),
    };
    match run_blocking(phone.call(target)) {
        Ok(Ok(Some(call_id))) => {
            info!("呼叫已发起: {}", call_id);
            SDK_OK
        }
        Ok(Ok(None)) => SDK_OK,
        Ok(Err(e)) => report_error("CallPhone", &e),
        Err(code) => code,
    }
}

/// 挂断全部呼叫
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn TerminateAllCalls() -> c_int {
    let Some(phone) = current_phone() else {
        return SDK_ERR_NOT_INITIALIZED;
    };
    match run_blocking(phone.hangup_all()) {
        Ok(Ok(())) => SDK_OK,
        Ok(Err(e)) => report_error("TerminateAllCalls", &e),
        Err(code) => code,
    }
}

/// 设置事件回调，传 NULL 清除
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn SetEventCallback(callback: Option<EventCallback>) {
    match EVENT_CALLBACK.write() {
        Ok(mut guard) => *guard = callback,
        Err(poisoned) => *poisoned.into_inner() = callback,
    }
}

/// 释放 SDK 返回的字符串
///
/// # Safety
/// `ptr` 为空或由本 SDK 返回且尚未释放
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn FreeString(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// 挂断、注销并关闭引擎，之后可再次 `InitSdk`
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn ShutdownSdk() {
    let phone = match PHONE.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(phone) = phone {
        if run_blocking(phone.shutdown()).is_err() {
            warn!("SDK 未能正常关闭");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, SipError};
    use crate::events::MessageInfo;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_c_str_arg() {
        let value = CString::new("pbx.example.com").unwrap();
        assert_eq!(
            unsafe { c_str_arg(value.as_ptr()) },
            Some("pbx.example.com".to_string())
        );
        assert_eq!(unsafe { c_str_arg(std::ptr::null()) }, None);

        let invalid = [0xffu8 as c_char, 0];
        assert_eq!(unsafe { c_str_arg(invalid.as_ptr()) }, None);
    }

    #[test]
    fn test_returned_string_can_be_freed() {
        let ptr = into_c_string("handle-1".to_string());
        assert!(!ptr.is_null());
        assert_eq!(unsafe { CStr::from_ptr(ptr) }.to_str().unwrap(), "handle-1");
        unsafe {
            FreeString(ptr);
            FreeString(std::ptr::null_mut());
        }
        assert!(into_c_string("a\0b".to_string()).is_null());
    }

    #[test]
    fn test_error_status() {
        assert_eq!(error_status(&CallError::NotInitialized), SDK_ERR_NOT_INITIALIZED);
        assert_eq!(error_status(&CallError::NetworkUnreachable), SDK_ERR_NETWORK);
        assert_eq!(
            error_status(&ConfigError::Missing("phone number".to_string()).into()),
            SDK_ERR_INVALID_ARGUMENT
        );
        assert_eq!(
            error_status(&SipError::Transport("closed".to_string()).into()),
            SDK_ERR_ENGINE
        );
    }

    #[test]
    fn test_null_arguments_are_rejected() {
        unsafe {
            assert!(Register(std::ptr::null(), std::ptr::null(), std::ptr::null()).is_null());
            assert_eq!(Unregistration(std::ptr::null()), SDK_ERR_INVALID_ARGUMENT);
            assert_eq!(
                CallPhone(std::ptr::null(), std::ptr::null(), 5060, false),
                SDK_ERR_INVALID_ARGUMENT
            );
        }
    }

    #[test]
    fn test_operations_before_init() {
        let sip = CString::new("1002").unwrap();
        unsafe {
            assert_eq!(
                CallPhone(sip.as_ptr(), std::ptr::null(), 0, false),
                SDK_ERR_NOT_INITIALIZED
            );
        }
        assert_eq!(TerminateAllCalls(), SDK_ERR_NOT_INITIALIZED);
        ShutdownSdk();
    }

    #[tokio::test]
    async fn test_blocking_call_on_runtime_thread_is_refused() {
        assert_eq!(run_blocking(async { 1 }), Err(SDK_ERR_REENTRANT));
    }

    static CALLBACK_GOT_JSON: AtomicBool = AtomicBool::new(false);
    static CALLBACK_OFF_RUNTIME: AtomicBool = AtomicBool::new(false);
    static NESTED_RESULT: AtomicI32 = AtomicI32::new(0);
    static NESTED_EXPORT: AtomicI32 = AtomicI32::new(0);

    extern "C" fn reentrant_callback(json: *const c_char) {
        let json = unsafe { CStr::from_ptr(json) }.to_str().unwrap_or_default();
        CALLBACK_GOT_JSON.store(json.contains("message_received"), Ordering::SeqCst);
        CALLBACK_OFF_RUNTIME.store(Handle::try_current().is_err(), Ordering::SeqCst);
        NESTED_EXPORT.store(TerminateAllCalls(), Ordering::SeqCst);
        NESTED_RESULT.store(run_blocking(async { 7 }).unwrap_or(-1), Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_callback_may_call_back_into_sdk() {
        SetEventCallback(Some(reentrant_callback));

        // 事件在运行时线程上产生，回调在事件线程上执行
        CallbackSink.on_event(&PhoneEvent::MessageReceived(MessageInfo {
            from: "sip:1003@pbx.example.com".to_string(),
            body: "ping".to_string(),
        }));

        for _ in 0..100 {
            if NESTED_RESULT.load(Ordering::SeqCst) != 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        SetEventCallback(None);

        assert!(CALLBACK_GOT_JSON.load(Ordering::SeqCst));
        assert!(CALLBACK_OFF_RUNTIME.load(Ordering::SeqCst));
        assert_eq!(NESTED_RESULT.load(Ordering::SeqCst), 7);
        assert_eq!(NESTED_EXPORT.load(Ordering::SeqCst), SDK_ERR_NOT_INITIALIZED);
    }
}
