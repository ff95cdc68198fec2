use std::{io, net::SocketAddr, time::Duration};

use tokio::{net::UdpSocket, sync::Mutex};

/// Largest reply a bulb sends fits comfortably in this.
pub const RECV_BUFFER_SIZE: usize = 1024;

/// One shared UDP socket for request/response exchanges with bulbs.
///
/// Every exchange holds the lock from send until the reply arrives or times
/// out, so replies can never be handed to the wrong caller. The socket is
/// created lazily and thrown away after any I/O error other than a timeout.
///
/// Datagrams still queued when an exchange starts belong to an earlier
/// exchange that timed out. They are discarded before sending.
///
/// Replies are matched by their source address only. On a LAN protocol
/// without authentication that is easy to spoof and must not be read as a
/// security boundary.
#[derive(Debug, Default)]
pub struct SocketManager {
    socket: Mutex<Option<UdpSocket>>,
}

async fn bound_socket(slot: &mut Option<UdpSocket>) -> io::Result<&UdpSocket> {
    if slot.is_none() {
        *slot = Some(UdpSocket::bind(("0.0.0.0", 0)).await?);
    }

    slot.as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket missing"))
}

fn discard_stale(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<()> {
    loop {
        match socket.try_recv_from(buf) {
            Ok((len, from)) => log::debug!("Discarding stale {len} byte reply from {from}"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

async fn exchange(
    socket: &UdpSocket,
    data: &[u8],
    addr: SocketAddr,
    timeout: Duration,
) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    discard_stale(socket, &mut buf)?;
    socket.send_to(data, addr).await?;

    match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => Ok(Some((buf[..len].to_vec(), from))),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}

impl SocketManager {
    pub fn new() -> SocketManager {
        SocketManager::default()
    }

    /// Fire and forget.
    pub async fn send(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        let mut guard = self.socket.lock().await;

        let result = match bound_socket(&mut guard).await {
            Ok(socket) => socket.send_to(data, addr).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            log::warn!("Sending to {addr} failed, discarding socket: {e}");
            *guard = None;
        }

        result
    }

    /// Sends `data` and waits up to `timeout` for one reply datagram from
    /// `addr`. Returns `None` on timeout, I/O error, or a reply from anyone
    /// else.
    pub async fn send_and_receive(
        &self,
        data: &[u8],
        addr: SocketAddr,
        timeout: Duration,
    ) -> Option<Vec<u8>> {
        let mut guard = self.socket.lock().await;

        let result = match bound_socket(&mut guard).await {
            Ok(socket) => exchange(socket, data, addr, timeout).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Some((reply, from))) if from.ip() == addr.ip() => Some(reply),
            Ok(Some((_, from))) => {
                log::debug!("Dropping reply from {from}, expected {addr}");
                None
            }
            Ok(None) => {
                log::debug!("No reply from {addr} within {timeout:?}");
                None
            }
            Err(e) => {
                log::warn!("Exchange with {addr} failed, discarding socket: {e}");
                *guard = None;
                None
            }
        }
    }

    #[cfg(test)]
    async fn has_socket(&self) -> bool {
        self.socket.lock().await.is_some()
    }
}
