use clap::Parser;
use sip_phone::{
    create_phone, utils, CallTarget, ChannelSink, EngineConfig, LogSink, PhoneEvent,
    RegistrationHandle,
};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};

/// SIP Phone CLI Application
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Account config: server,username,password,port
    #[arg(short, long, env = "SIP_CONFIG")]
    config: String,

    /// Call target (number or user@domain)
    #[arg(short, long, env = "SIP_TARGET")]
    target: Option<String>,

    /// Target host, defaults to the registrar
    #[arg(long, default_value = "")]
    host: String,

    /// Target port, 0 for none
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Offer video in the call
    #[arg(long)]
    video: bool,

    /// Local IP to bind, defaults to the first non-loopback IPv4 interface
    #[arg(long)]
    local_ip: Option<IpAddr>,

    /// Local SIP port, 0 for ephemeral
    #[arg(long, default_value_t = 0)]
    local_port: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn print_event(event: &PhoneEvent) {
    match event {
        PhoneEvent::RegistrationStateChanged(info) => {
            println!("[注册] {}: {} -> {}", info.username, info.previous_state, info.state);
            if let Some(code) = info.status_code {
                println!("       状态码 {} {}", code, info.reason.as_deref().unwrap_or(""));
            }
        }
        PhoneEvent::CallStateChanged(info) => {
            println!("[呼叫] {}: {} -> {}", info.remote_uri, info.previous_state, info.state);
            if let Some(reason) = &info.reason {
                println!("       {}", reason);
            }
        }
        PhoneEvent::MessageReceived(info) => println!("[消息] {}: {}", info.from, info.body),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    utils::initialize_logging(args.log_level.as_str());

    let config = EngineConfig {
        local_ip: args.local_ip,
        local_port: args.local_port,
        ..EngineConfig::default()
    };
    let phone = create_phone(config);
    let (sink, mut events) = ChannelSink::new();
    phone.subscribe(Arc::new(sink)).await;
    phone.subscribe(Arc::new(LogSink)).await;

    if let Err(e) = phone.init().await {
        eprintln!("初始化失败: {}", e);
        return Err(e.into());
    }

    let handle = match phone
        .register_with_config(RegistrationHandle::generate(), &args.config)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("注册失败: {}", e);
            phone.shutdown().await;
            return Err(e.into());
        }
    };
    info!("注册句柄: {}", handle);

    if let Some(target) = &args.target {
        let result = match CallTarget::new(target, &args.host, args.port, args.video) {
            Ok(target) => phone.call(target).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(Some(call_id)) => info!("呼叫已发起: {}", call_id),
            Ok(None) => println!("被叫为本机身份，未发起呼叫"),
            Err(e) => {
                error!("呼叫失败 [{}]: {}", e.error_code(), e);
                eprintln!("呼叫失败: {}", e);
            }
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    if let Err(e) = phone.hangup_all().await {
        error!("挂断失败: {}", e);
    }
    if let Err(e) = phone.unregister(&handle).await {
        error!("注销失败: {}", e);
    }
    phone.shutdown().await;
    Ok(())
}
