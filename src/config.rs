/// 话机配置模块
///
/// 解析账号配置串 `服务器地址,用户名,密码,SIP端口`，并提供引擎运行参数
use crate::error::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use std::str::FromStr;

/// 默认 SIP 端口
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// 默认注册有效期（秒）
pub const DEFAULT_REGISTER_EXPIRES: u32 = 3600;

/// 主机名或 IPv4 地址
static HOST_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9.\-]*[A-Za-z0-9])?$").expect("valid host regex")
});

/// SIP 账号配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// 注册服务器地址（域名或IP）
    pub server_host: String,

    /// SIP 用户名
    pub username: String,

    /// SIP 密码
    pub password: String,

    /// SIP 端口
    pub sip_port: u16,
}

impl Account {
    /// 从独立字段创建账号，`domain` 可以带端口 (例如 "10.0.0.1:5080")
    pub fn new(domain: &str, username: &str, password: &str) -> Result<Self, ConfigError> {
        let (host, port) = split_host_port(domain.trim())?;
        Self::build(host, username, password, port)
    }

    /// 解析配置串 `CSserverIP,userName,passWord,sipPort`
    pub fn from_config_str(config: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = config.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(ConfigError::Invalid(format!(
                "配置串应为 `服务器,用户名,密码,端口`，实际有 {} 段",
                parts.len()
            )));
        }
        let port = parse_port(parts[3])?;
        Self::build(parts[0], parts[1], parts[2], port)
    }

    fn build(host: &str, username: &str, password: &str, port: u16) -> Result<Self, ConfigError> {
        if host.is_empty() {
            return Err(ConfigError::Missing("server".to_string()));
        }
        if !HOST_REGEX.is_match(host) {
            return Err(ConfigError::Invalid(format!("服务器地址无效: {}", host)));
        }
        let username = username.trim();
        if username.is_empty() {
            return Err(ConfigError::Missing("username".to_string()));
        }
        Ok(Self {
            server_host: host.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            sip_port: port,
        })
    }

    /// 注册服务器 URI，例如 `sip:10.0.0.1:5060`
    pub fn server_uri(&self) -> String {
        format!("sip:{}:{}", self.server_host, self.sip_port)
    }

    /// 本机身份 URI，例如 `sip:1001@10.0.0.1`
    pub fn identity_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.server_host)
    }
}

impl FromStr for Account {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_config_str(s)
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::Parse(format!("端口无效: {}", value))),
        Ok(port) => Ok(port),
    }
}

fn split_host_port(domain: &str) -> Result<(&str, u16), ConfigError> {
    match domain.rsplit_once(':') {
        Some((host, port)) => Ok((host, parse_port(port)?)),
        None => Ok((domain, DEFAULT_SIP_PORT)),
    }
}

/// SIP 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// User-Agent字符串
    pub user_agent: String,

    /// 绑定的本地地址，未设置时使用第一个非回环 IPv4 接口
    pub local_ip: Option<IpAddr>,

    /// 本地 SIP 端口，0 表示由系统分配
    pub local_port: u16,

    /// 注册有效期（秒）
    pub register_expires: u32,

    /// SDP 中通告的音频端口
    pub audio_port: u16,

    /// SDP 中通告的视频端口
    pub video_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("sip-phone/{}", crate::VERSION),
            local_ip: None,
            local_port: 0,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            audio_port: 40000,
            video_port: 40002,
        }
    }
}
