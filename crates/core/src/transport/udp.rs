use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

/// Poll interval of socket reader threads, so that dropping the endpoint
/// terminates them promptly.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

const PORT_PAIR_ATTEMPTS: usize = 32;

/// Largest datagram a reader thread accepts.
const MAX_DATAGRAM: usize = 65_536;

fn unspecified_for(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Bind an ephemeral socket of the same address family as `remote` and
/// connect it there.
pub fn connect_ephemeral(remote: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(unspecified_for(&remote), 0))?;
    socket.connect(remote)?;
    Ok(socket)
}

/// Bind an (RTP, RTCP) socket pair on adjacent ports, RTP on the even one
/// (RFC 3550 §11).
///
/// The kernel picks an ephemeral port; odd picks and pairs whose upper
/// port is taken are retried.
pub fn bind_port_pair(ip: IpAddr) -> Result<(UdpSocket, UdpSocket)> {
    for _ in 0..PORT_PAIR_ATTEMPTS {
        let media = UdpSocket::bind(SocketAddr::new(ip, 0))?;
        let port = media.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            continue;
        }
        match UdpSocket::bind(SocketAddr::new(ip, port + 1)) {
            Ok(control) => {
                tracing::trace!(rtp_port = port, rtcp_port = port + 1, "bound port pair");
                return Ok((media, control));
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Io(std::io::Error::new(
        ErrorKind::AddrInUse,
        "no adjacent even/odd UDP port pair available",
    )))
}

/// Resolve `host:port`, blocking. Meant to run off the dispatch thread.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs().map_err(|e| Error::Resolve {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    addrs.next().ok_or_else(|| Error::Resolve {
        host: host.to_string(),
        reason: "no addresses".to_string(),
    })
}

/// Blocking datagram read loop.
///
/// Checks the `running` flag between reads with a
/// [`READ_POLL_INTERVAL`] timeout so the owner can terminate it by
/// clearing the flag. Every datagram is handed to `on_datagram`.
pub fn read_loop(socket: UdpSocket, running: Arc<AtomicBool>, mut on_datagram: impl FnMut(&[u8])) {
    if let Err(e) = socket.set_read_timeout(Some(READ_POLL_INTERVAL)) {
        tracing::warn!(error = %e, "failed to set read timeout, reader exiting");
        return;
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(n) => on_datagram(&buf[..n]),
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "UDP read error");
                }
                break;
            }
        }
    }
    tracing::debug!("UDP read loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_pair_is_even_and_adjacent() {
        let (media, control) = bind_port_pair(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let rtp = media.local_addr().unwrap().port();
        let rtcp = control.local_addr().unwrap().port();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
    }

    #[test]
    fn resolve_numeric_host() {
        let addr = resolve("127.0.0.1", 5004).unwrap();
        assert_eq!(addr, "127.0.0.1:5004".parse().unwrap());
    }

    #[test]
    fn connect_ephemeral_matches_family() {
        let socket = connect_ephemeral("127.0.0.1:9".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
        assert_eq!(socket.peer_addr().unwrap().port(), 9);
    }

    #[test]
    fn read_loop_stops_when_flag_cleared() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = std::sync::mpsc::channel();

        let flag = running.clone();
        let reader = std::thread::spawn(move || read_loop(socket, flag, |d| tx.send(d.len()).unwrap()));

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(&[1, 2, 3], addr).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);

        running.store(false, Ordering::SeqCst);
        reader.join().unwrap();
    }
}
