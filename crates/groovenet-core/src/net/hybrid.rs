//! Hybrid tunnel transport
//!
//! Tunnels traffic to a fixed rendezvous server over one TCP
//! connection. Outbound packets accumulate in an outbox that a flusher
//! thread wraps into a single hybrid batch per interval, so many small
//! safety messages ride one stream write. Inbound batches are unpacked
//! into the shared queue like any other transport.

use crate::config::{ModelParams, ParamSpec, ParamType};
use crate::error::{ConfigError, TransportError};
use crate::net::packet::{HybridPacket, Packet};
use crate::net::transport::{decode_from_stream, RunFlag, RxQueue, StreamDecode, Transport};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(200);

pub struct HybridTransport {
    server_addr: SocketAddr,
    interval: Duration,
    queue: Arc<RxQueue>,
    running: Arc<RunFlag>,
    outbox: Arc<Mutex<Vec<Packet>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl HybridTransport {
    pub fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "net.port",
            ParamSpec::new("46002", "rendezvous server TCP port", ParamType::Int),
        );
        declared.declare(
            "net.flush_interval_ms",
            ParamSpec::new(
                "1000",
                "how often the outbox is flushed as one batch",
                ParamType::Int,
            ),
        );
        let server = declared.get_address("net.server_addr")?;
        let port = declared.get_u32("net.port")? as u16;
        Ok(Self {
            server_addr: SocketAddr::from((server.to_ipv4(), port)),
            interval: Duration::from_millis(declared.get_u64("net.flush_interval_ms")?.max(1)),
            queue: Arc::new(RxQueue::new()),
            running: Arc::new(RunFlag::new()),
            outbox: Arc::new(Mutex::new(Vec::new())),
            threads: Mutex::new(Vec::new()),
        })
    }

    fn spawn_reader(&self, mut stream: TcpStream) {
        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let server = self.server_addr.to_string();
        let handle = std::thread::Builder::new()
            .name("hybrid-rx".to_string())
            .spawn(move || {
                let mut chunk = [0u8; 8192];
                let mut acc: Vec<u8> = Vec::new();
                while running.get() {
                    match stream.read(&mut chunk) {
                        Ok(0) => {
                            warn!("tunnel closed by server");
                            running.set(false);
                            break;
                        }
                        Ok(n) => {
                            acc.extend_from_slice(&chunk[..n]);
                            loop {
                                match decode_from_stream(&mut acc) {
                                    StreamDecode::Packet(Packet::Hybrid(batch)) => {
                                        debug!(members = batch.packets.len(), "batch received");
                                        for member in batch.packets {
                                            queue.push(member);
                                        }
                                    }
                                    StreamDecode::Packet(packet) => queue.push(packet),
                                    StreamDecode::Incomplete => break,
                                    StreamDecode::Corrupt(source) => {
                                        let err = TransportError::Codec {
                                            peer: server.clone(),
                                            source,
                                        };
                                        warn!(%err, "corrupt tunnel stream, stopping");
                                        running.set(false);
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
                                peer: server.clone(),
                                source,
                            };
                            warn!(%err, "tunnel read failed, stopping");
                            running.set(false);
                            break;
                        }
                    }
                }
            })
            .expect("spawning hybrid reader thread");
        self.threads.lock().unwrap().push(handle);
    }

    fn spawn_flusher(&self, mut stream: TcpStream) {
        let outbox = Arc::clone(&self.outbox);
        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("hybrid-tx".to_string())
            .spawn(move || {
                while running.get() {
                    std::thread::sleep(interval);
                    let pending: Vec<Packet> = std::mem::take(&mut *outbox.lock().unwrap());
                    if pending.is_empty() {
                        continue;
                    }
                    let batch = Packet::Hybrid(HybridPacket { packets: pending });
                    if let Err(e) = stream.write_all(&batch.encode()) {
                        warn!(error = %e, "tunnel write failed, stopping");
                        running.set(false);
                        break;
                    }
                }
            })
            .expect("spawning hybrid flusher thread");
        self.threads.lock().unwrap().push(handle);
    }
}

impl Transport for HybridTransport {
    fn start(&self) -> Result<(), TransportError> {
        if self.running.get() {
            return Ok(());
        }
        let stream =
            TcpStream::connect(self.server_addr).map_err(|source| TransportError::Connect {
                addr: self.server_addr.to_string(),
                source,
            })?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(TransportError::Io)?;
        let writer = stream.try_clone().map_err(TransportError::Io)?;

        self.running.set(true);
        self.spawn_reader(stream);
        self.spawn_flusher(writer);
        info!(server = %self.server_addr, "hybrid tunnel started");
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
        info!("hybrid tunnel stopped");
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Queue a packet for the next batch flush. Only generic and
    /// safety packets ride the tunnel: batches cannot nest, and squelch
    /// is meaningful only within the local radio neighborhood.
    fn broadcast(&self, packet: &Packet) -> Result<(), TransportError> {
        if !self.running.get() {
            return Err(TransportError::NotStarted);
        }
        if !matches!(packet, Packet::Generic(_) | Packet::Safety(_)) {
            return Ok(());
        }
        self.outbox.lock().unwrap().push(packet.clone());
        Ok(())
    }

    fn rx_queue(&self) -> Arc<RxQueue> {
        Arc::clone(&self.queue)
    }
}

impl Drop for HybridTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
