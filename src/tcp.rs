//! TCP socket options applied to accepted and connected sockets.
//!
//! Failures here are logged warnings; a socket without keepalive still
//! carries traffic.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::warn;

/// Keepalive probe interval once the idle timeout has elapsed.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Probes sent before the connection is declared dead.
#[cfg(target_os = "linux")]
const KEEPALIVE_RETRIES: u32 = 5;

/// Enable SO_KEEPALIVE with the given idle time.
///
/// On Linux the probe interval is 10 s and the connection is declared dead
/// after 5 unanswered probes.
pub fn enable_keepalive(stream: &TcpStream, idle: Duration) {
    let keepalive = TcpKeepalive::new().with_time(idle);

    #[cfg(target_os = "linux")]
    let keepalive = keepalive
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);

    #[cfg(not(target_os = "linux"))]
    let _ = KEEPALIVE_INTERVAL;

    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!("failed to enable TCP keepalive: {e}");
    }
}

/// Disable Nagle's algorithm.
pub fn enable_no_delay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to enable TCP_NODELAY: {e}");
    }
}

/// Set SO_RCVBUF.
pub fn set_recv_buffer_size(stream: &TcpStream, size: usize) {
    if let Err(e) = SockRef::from(stream).set_recv_buffer_size(size) {
        warn!("failed to set receive buffer size: {e}");
    }
}

/// Set SO_SNDBUF.
pub fn set_send_buffer_size(stream: &TcpStream, size: usize) {
    if let Err(e) = SockRef::from(stream).set_send_buffer_size(size) {
        warn!("failed to set send buffer size: {e}");
    }
}
