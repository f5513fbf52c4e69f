//! UDP datagram transport
//!
//! One socket, one reader thread. Outbound packets go to the subnet
//! broadcast address; inbound datagrams are decoded and queued for the
//! simulator loop. The reader uses a short receive timeout so the stop
//! flag is observed promptly.

use crate::config::{ModelParams, ParamSpec, ParamType};
use crate::error::{ConfigError, TransportError};
use crate::net::packet::Packet;
use crate::net::transport::{ingest_datagram, RunFlag, RxQueue, Transport};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_DATAGRAM: usize = 65_536;

pub struct UdpTransport {
    bind_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    queue: Arc<RxQueue>,
    running: Arc<RunFlag>,
    socket: Mutex<Option<UdpSocket>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "net.port",
            ParamSpec::new("46000", "UDP port to bind and send to", ParamType::Int),
        );
        declared.declare(
            "net.broadcast_addr",
            ParamSpec::new(
                "255.255.255.255",
                "destination address for outbound broadcasts",
                ParamType::Address,
            ),
        );
        let port = declared.get_u32("net.port")? as u16;
        let broadcast = declared.get_address("net.broadcast_addr")?;
        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            broadcast_addr: SocketAddr::from((broadcast.to_ipv4(), port)),
            queue: Arc::new(RxQueue::new()),
            running: Arc::new(RunFlag::new()),
            socket: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    fn spawn_reader(&self, socket: UdpSocket) {
        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("udp-rx".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                while running.get() {
                    match socket.recv_from(&mut buf) {
                        Ok((n, peer)) => {
                            debug!(%peer, bytes = n, "datagram received");
                            ingest_datagram(&buf[..n], &queue, &peer.to_string());
                        }
                        Err(e)
                            if e.kind() == ErrorKind::WouldBlock
                                || e.kind() == ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!(error = %e, "udp receive failed");
                        }
                    }
                }
            })
            .expect("spawning udp reader thread");
        *self.reader.lock().unwrap() = Some(handle);
    }
}

impl Transport for UdpTransport {
    fn start(&self) -> Result<(), TransportError> {
        if self.running.get() {
            return Ok(());
        }
        let socket = UdpSocket::bind(self.bind_addr).map_err(|source| TransportError::Bind {
            addr: self.bind_addr.to_string(),
            source,
        })?;
        socket
            .set_broadcast(true)
            .map_err(TransportError::Io)?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(TransportError::Io)?;
        let reader_socket = socket.try_clone().map_err(TransportError::Io)?;

        self.running.set(true);
        self.spawn_reader(reader_socket);
        *self.socket.lock().unwrap() = Some(socket);
        info!(addr = %self.bind_addr, "udp transport started");
        Ok(())
    }

    fn stop(&self) {
        if !self.running.get() {
            return;
        }
        self.running.set(false);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.socket.lock().unwrap() = None;
        info!("udp transport stopped");
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn broadcast(&self, packet: &Packet) -> Result<(), TransportError> {
        let guard = self.socket.lock().unwrap();
        let socket = guard.as_ref().ok_or(TransportError::NotStarted)?;
        let bytes = packet.encode();
        socket
            .send_to(&bytes, self.broadcast_addr)
            .map_err(|source| TransportError::Write {
                peer: self.broadcast_addr.to_string(),
                source,
            })?;
        Ok(())
    }

    fn rx_queue(&self) -> Arc<RxQueue> {
        Arc::clone(&self.queue)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
