//! Readiness notification for process supervisors.
//!
//! Sends `READY=1` to the datagram socket named by `NOTIFY_SOCKET`. Paths
//! starting with `@` name a Linux abstract socket.

use std::io;
use std::os::unix::net::UnixDatagram;

use tracing::{debug, warn};

/// Environment variable naming the supervisor socket.
pub const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";

/// Tell the supervisor the process is ready. Returns `true` if a
/// notification was sent; no socket configured is not an error.
pub fn notify_ready() -> bool {
    let Some(target) = std::env::var_os(NOTIFY_SOCKET) else {
        return false;
    };
    let target = target.to_string_lossy().into_owned();
    match send(&target, "READY=1") {
        Ok(()) => {
            debug!(socket = %target, "readiness notified");
            true
        }
        Err(e) => {
            warn!(socket = %target, error = %e, "readiness notification failed");
            false
        }
    }
}

fn send(target: &str, state: &str) -> io::Result<()> {
    let socket = UnixDatagram::unbound()?;
    if let Some(name) = target.strip_prefix('@') {
        return send_abstract(&socket, name, state);
    }
    let _ = socket.send_to(state.as_bytes(), target)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &str, state: &str) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let _ = socket.send_to_addr(state.as_bytes(), &addr)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, _name: &str, _state: &str) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "abstract sockets need Linux"))
}
