/// 工具函数模块
///
/// 网卡查询、Call-ID 生成与日志初始化
use std::net::IpAddr;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// 获取第一个非回环的网络接口 IP 地址
///
/// 遍历系统所有网络接口，返回第一个非回环的 IPv4 地址
///
/// # 返回
/// - `Ok(IpAddr)` - 成功找到的 IPv4 地址
/// - `Err` - 未找到可用的 IPv4 接口
///
/// # 示例
/// ```rust,no_run
/// use sip_phone::utils::get_first_non_loopback_interface;
///
/// let local_ip = get_first_non_loopback_interface().unwrap();
/// println!("本地IP: {}", local_ip);
/// ```
pub fn get_first_non_loopback_interface() -> Result<IpAddr, Box<dyn std::error::Error>> {
    for interface in get_if_addrs::get_if_addrs()? {
        if !interface.is_loopback() {
            match interface.addr {
                get_if_addrs::IfAddr::V4(ref addr) => return Ok(IpAddr::V4(addr.ip)),
                _ => continue,
            }
        }
    }
    Err("未找到 IPv4 接口".into())
}

/// 生成基于 UUID 的 Call-ID
///
/// 使用 UUID v4 代替 rsipstack 默认的随机文本
///
/// # 示例
/// ```rust
/// use sip_phone::utils::make_call_id;
///
/// let call_id = make_call_id(Some("example.com"));
/// assert!(call_id.to_string().ends_with("@example.com"));
/// ```
pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    let uuid = Uuid::new_v4();

    match domain {
        Some(d) => format!("{}@{}", uuid, d).into(),
        None => uuid.to_string().into(),
    }
}

/// 初始化日志
///
/// `RUST_LOG` 优先于 `level`；重复调用时保留第一次的配置
pub fn initialize_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .try_init();

    if result.is_err() {
        tracing::debug!("日志已初始化");
    }
}
