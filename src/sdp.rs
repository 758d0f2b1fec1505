/// SDP offer 构造
///
/// 仅生成静态 offer（PCMU/PCMA/telephone-event，可选 H.264 视频），
/// 媒体协商与收发由对端及媒体层处理
use std::net::IpAddr;

/// 构造 INVITE 携带的 SDP offer
pub fn build_offer(
    local_ip: IpAddr,
    session_id: u64,
    audio_port: u16,
    video_port: Option<u16>,
) -> String {
    let ip_type = if local_ip.is_ipv6() { "IP6" } else { "IP4" };
    let mut sdp = format!(
        "v=0\r\n\
         o=- {session_id} {session_id} IN {ip_type} {local_ip}\r\n\
         s=sip-phone\r\n\
         c=IN {ip_type} {local_ip}\r\n\
         t=0 0\r\n\
         m=audio {audio_port} RTP/AVP 0 8 101\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=fmtp:101 0-16\r\n\
         a=sendrecv\r\n"
    );

    if let Some(video_port) = video_port {
        sdp.push_str(&format!(
            "m=video {video_port} RTP/AVP 96\r\n\
             a=rtpmap:96 H264/90000\r\n\
             a=fmtp:96 profile-level-id=42e01f;packetization-mode=1\r\n\
             a=sendrecv\r\n"
        ));
    }

    sdp
}
