//! UDP transport for the OSC link to the device script.
//!
//! Requests leave through an outbound socket bound to an ephemeral port;
//! replies arrive on a second socket bound to the configured receive port
//! and are pushed, one datagram at a time, to a handler running on a
//! dedicated receive thread.

use crate::config::Config;
use crate::error::{Error, Result};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest datagram we accept.
const RECV_BUFFER_SIZE: usize = 65536;

/// How often the receive thread checks its shutdown flag.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outbound half of the transport.
///
/// The correlation engine only ever talks to this trait, so anything that
/// can move bytes toward the peer (or record them in a test) plugs in here.
pub trait DatagramSink: Send + Sync {
    /// Send one encoded datagram to the peer.
    fn send_datagram(&self, bytes: &[u8]) -> Result<()>;
}

/// Encode a single OSC message.
pub fn encode_message(addr: &str, args: Vec<OscType>) -> Result<Vec<u8>> {
    let packet = OscPacket::Message(OscMessage {
        addr: addr.into(),
        args,
    });
    Ok(encoder::encode(&packet)?)
}

/// Decode one datagram into an OSC packet.
pub fn decode_datagram(bytes: &[u8]) -> Result<OscPacket> {
    let (_, packet) =
        rosc::decoder::decode_udp(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    Ok(packet)
}

/// UDP socket pair talking to a single peer.
#[derive(Clone)]
pub struct UdpTransport {
    send_sock: Arc<UdpSocket>,
    recv_sock: Arc<UdpSocket>,
    /// Peer address, resolved once at bind time.
    pub peer_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind both sockets according to `config`.
    pub fn bind(config: &Config) -> Result<Self> {
        let peer_addr = resolve_peer(&config.send_addr())?;
        let send_sock = if peer_addr.is_ipv4() {
            UdpSocket::bind("0.0.0.0:0")?
        } else {
            UdpSocket::bind("[::]:0")?
        };
        let recv_sock = UdpSocket::bind(config.receive_addr())?;
        recv_sock.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        log::info!(
            "[OSC] Listening on {}, sending to {}",
            recv_sock.local_addr()?,
            peer_addr
        );
        Ok(Self {
            send_sock: Arc::new(send_sock),
            recv_sock: Arc::new(recv_sock),
            peer_addr,
        })
    }

    /// Address the receive socket actually bound to.
    ///
    /// Useful when the configured receive port is 0.
    pub fn local_receive_addr(&self) -> Result<SocketAddr> {
        Ok(self.recv_sock.local_addr()?)
    }

    /// Start the receive thread.
    ///
    /// Every datagram is handed to `on_datagram` in arrival order. Receive
    /// errors are logged and never stop the loop; only the returned handle
    /// does.
    pub fn spawn_receiver<F>(&self, mut on_datagram: F) -> Result<ReceiverHandle>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let sock = Arc::clone(&self.recv_sock);
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("liveosc-recv".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                while !thread_shutdown.load(Ordering::Relaxed) {
                    match sock.recv_from(&mut buf) {
                        Ok((size, from)) => {
                            log::trace!("[OSC] {} bytes from {}", size, from);
                            on_datagram(&buf[..size]);
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => {
                            log::warn!("[OSC] Receive error: {}", e);
                            thread::sleep(RECV_POLL_INTERVAL);
                        }
                    }
                }
                log::debug!("[OSC] Receive thread stopped");
            })?;

        Ok(ReceiverHandle {
            shutdown,
            thread: Some(thread),
        })
    }
}

/// Resolve a "host:port" string, preferring IPv4.
fn resolve_peer(addr: &str) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| Error::Config(format!("peer address {} did not resolve", addr)))
}

impl DatagramSink for UdpTransport {
    fn send_datagram(&self, bytes: &[u8]) -> Result<()> {
        self.send_sock.send_to(bytes, self.peer_addr)?;
        Ok(())
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Owns the receive thread; stops and joins it on drop.
pub struct ReceiverHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReceiverHandle {
    /// Stop the receive thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
