//! TCP connection transport
//!
//! Connection-oriented variant: a listener thread accepts peers, each
//! connection gets its own reader thread, and a link cache maps peer
//! address to write half. A failed read or write drops that one
//! connection; everything else keeps running. Broadcast iterates the
//! link cache and patches the receiver address per link before
//! encoding.

use crate::config::{ModelParams, ParamSpec, ParamType};
use crate::error::{ConfigError, TransportError};
use crate::net::packet::{Address, Packet};
use crate::net::transport::{decode_from_stream, RunFlag, RxQueue, StreamDecode, Transport};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Write halves of live connections, keyed by peer entity address.
type LinkCache = Arc<Mutex<HashMap<Address, TcpStream>>>;

pub struct TcpTransport {
    bind_addr: SocketAddr,
    port: u16,
    queue: Arc<RxQueue>,
    running: Arc<RunFlag>,
    links: LinkCache,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "net.port",
            ParamSpec::new("46001", "TCP port to listen on and dial", ParamType::Int),
        );
        let port = declared.get_u32("net.port")? as u16;
        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            port,
            queue: Arc::new(RxQueue::new()),
            running: Arc::new(RunFlag::new()),
            links: Arc::new(Mutex::new(HashMap::new())),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Dial a peer by entity address and add it to the link cache.
    pub fn connect(&self, peer: Address) -> Result<(), TransportError> {
        if !self.running.get() {
            return Err(TransportError::NotStarted);
        }
        let addr = SocketAddr::from((peer.to_ipv4(), self.port));
        let stream = TcpStream::connect(addr).map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        self.register(peer, stream)
    }

    fn register(&self, peer: Address, stream: TcpStream) -> Result<(), TransportError> {
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(TransportError::Io)?;
        let reader = stream.try_clone().map_err(TransportError::Io)?;
        self.links.lock().unwrap().insert(peer, stream);
        spawn_connection_reader(
            peer,
            reader,
            Arc::clone(&self.queue),
            Arc::clone(&self.running),
            Arc::clone(&self.links),
        );
        debug!(%peer, "tcp link registered");
        Ok(())
    }

    fn spawn_listener(&self, listener: TcpListener) {
        let running = Arc::clone(&self.running);
        let links = Arc::clone(&self.links);
        let queue = Arc::clone(&self.queue);
        let threads_outer = &self.threads;

        // The listener thread registers accepted connections itself, so
        // it carries clones of everything the register path needs.
        let handle = std::thread::Builder::new()
            .name("tcp-accept".to_string())
            .spawn({
                let running = Arc::clone(&running);
                let links = Arc::clone(&links);
                let queue = Arc::clone(&queue);
                move || {
                    while running.get() {
                        match listener.accept() {
                            Ok((stream, peer_sock)) => {
                                let peer = match peer_sock {
                                    SocketAddr::V4(v4) => Address::from_ipv4(*v4.ip()),
                                    SocketAddr::V6(_) => {
                                        warn!(%peer_sock, "rejecting non-ipv4 peer");
                                        continue;
                                    }
                                };
                                if stream.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
                                    continue;
                                }
                                let reader = match stream.try_clone() {
                                    Ok(r) => r,
                                    Err(e) => {
                                        warn!(%peer, error = %e, "clone failed on accept");
                                        continue;
                                    }
                                };
                                links.lock().unwrap().insert(peer, stream);
                                debug!(%peer, "tcp peer accepted");
                                spawn_connection_reader(
                                    peer,
                                    reader,
                                    Arc::clone(&queue),
                                    Arc::clone(&running),
                                    Arc::clone(&links),
                                );
                            }
                            Err(e)
                                if e.kind() == ErrorKind::WouldBlock
                                    || e.kind() == ErrorKind::TimedOut =>
                            {
                                std::thread::sleep(ACCEPT_POLL);
                            }
                            Err(e) => {
                                warn!(error = %e, "tcp accept failed");
                                std::thread::sleep(ACCEPT_POLL);
                            }
                        }
                    }
                }
            })
            .expect("spawning tcp accept thread");
        threads_outer.lock().unwrap().push(handle);
    }
}

/// Per-connection reader: reassembles the byte stream, queues decoded
/// packets, and drops the link on corruption or a failed read.
fn spawn_connection_reader(
    peer: Address,
    mut stream: TcpStream,
    queue: Arc<RxQueue>,
    running: Arc<RunFlag>,
    links: LinkCache,
) {
    let _ = std::thread::Builder::new()
        .name(format!("tcp-rx-{}", peer))
        .spawn(move || {
            let mut chunk = [0u8; 8192];
            let mut acc: Vec<u8> = Vec::new();
            while running.get() {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        acc.extend_from_slice(&chunk[..n]);
                        loop {
                            match decode_from_stream(&mut acc) {
                                StreamDecode::Packet(Packet::Hybrid(batch)) => {
                                    for member in batch.packets {
                                        queue.push(member);
                                    }
                                }
                                StreamDecode::Packet(packet) => queue.push(packet),
                                StreamDecode::Incomplete => break,
                                StreamDecode::Corrupt(source) => {
                                    let err = TransportError::Codec {
                                        peer: peer.to_string(),
                                        source,
                                    };
                                    warn!(%err, "dropping corrupt tcp link");
                                    links.lock().unwrap().remove(&peer);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e)
                        if e.kind() == ErrorKind::WouldBlock
                            || e.kind() == ErrorKind::TimedOut => {}
                    Err(source) => {
                        let err = TransportError::Read {
                            peer: peer.to_string(),
                            source,
                        };
                        warn!(%err, "tcp read failed, dropping link");
                        break;
                    }
                }
            }
            links.lock().unwrap().remove(&peer);
        });
}

impl Transport for TcpTransport {
    fn start(&self) -> Result<(), TransportError> {
        if self.running.get() {
            return Ok(());
        }
        let listener =
            TcpListener::bind(self.bind_addr).map_err(|source| TransportError::Bind {
                addr: self.bind_addr.to_string(),
                source,
            })?;
        listener.set_nonblocking(true).map_err(TransportError::Io)?;
        self.running.set(true);
        self.spawn_listener(listener);
        info!(addr = %self.bind_addr, "tcp transport started");
        Ok(())
    }

    fn stop(&self) {
        if !self.running.get() {
            return;
        }
        self.running.set(false);
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.links.lock().unwrap().clear();
        info!("tcp transport stopped");
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Send to every cached link, patching the receiver address per
    /// link. A failed write drops that link only.
    fn broadcast(&self, packet: &Packet) -> Result<(), TransportError> {
        if !self.running.get() {
            return Err(TransportError::NotStarted);
        }
        let mut links = self.links.lock().unwrap();
        let mut dead = Vec::new();
        for (peer, stream) in links.iter_mut() {
            let mut copy = packet.clone();
            copy.set_receiver(*peer);
            if let Err(e) = stream.write_all(&copy.encode()) {
                warn!(%peer, error = %e, "tcp write failed, dropping link");
                dead.push(*peer);
            }
        }
        for peer in dead {
            links.remove(&peer);
        }
        Ok(())
    }

    fn rx_queue(&self) -> Arc<RxQueue> {
        Arc::clone(&self.queue)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
