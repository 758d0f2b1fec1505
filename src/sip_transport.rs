/// SIP 传输层创建
use rsipstack::transport::{udp::UdpConnection, SipConnection};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 创建 UDP 传输连接
///
/// 绑定到 `local_addr`（端口为 0 时由系统分配）
pub async fn create_udp_connection(
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
) -> rsipstack::Result<SipConnection> {
    let connection =
        UdpConnection::create_connection(local_addr, None, Some(cancel_token.child_token()))
            .await?;
    info!("UDP 传输已创建: {}", local_addr);
    Ok(connection.into())
}
