//! Transport abstraction
//!
//! A transport carries encoded packets between this process and remote
//! peers. Each implementation owns its own reader thread(s); received
//! packets land in a shared [`RxQueue`] keyed by originator, which the
//! simulator drains once per loop iteration. Transports never touch
//! entity state directly.

use crate::error::{CodecError, TransportError};
use crate::net::packet::{Address, Packet};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Inbound packet queue shared between transport threads and the
/// simulator loop. Keyed by originator so the loop can promote unknown
/// originators before dispatching their traffic.
#[derive(Debug, Default)]
pub struct RxQueue {
    inner: Mutex<HashMap<Address, VecDeque<Packet>>>,
}

impl RxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one packet under its originator. Packets without a header
    /// (unexpanded hybrid batches) are ignored; callers unpack batches
    /// before pushing.
    pub fn push(&self, packet: Packet) {
        let origin = match packet.sequence() {
            Some(seq) => seq.origin,
            None => return,
        };
        self.inner
            .lock()
            .unwrap()
            .entry(origin)
            .or_default()
            .push_back(packet);
    }

    /// Take everything queued so far
    pub fn drain_all(&self) -> Vec<(Address, Vec<Packet>)> {
        self.inner
            .lock()
            .unwrap()
            .drain()
            .map(|(origin, queue)| (origin, queue.into_iter().collect()))
            .collect()
    }

    /// Total queued packets across all originators
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A transport endpoint. `start` spawns the reader thread(s); `stop`
/// asks them to exit and is idempotent.
pub trait Transport: Send + Sync {
    /// Bind sockets and spawn reader threads
    fn start(&self) -> Result<(), TransportError>;

    /// Signal reader threads to exit
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Send one packet to every known peer
    fn broadcast(&self, packet: &Packet) -> Result<(), TransportError>;

    /// The inbound queue this transport fills
    fn rx_queue(&self) -> Arc<RxQueue>;
}

/// Shared run flag for transport reader threads.
#[derive(Debug, Default)]
pub struct RunFlag(AtomicBool);

impl RunFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self, running: bool) {
        self.0.store(running, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decode every packet in a datagram into the queue, expanding hybrid
/// batches into their members. A malformed tail is logged and dropped;
/// packets already decoded stay queued.
pub fn ingest_datagram(bytes: &[u8], queue: &RxQueue, peer: &str) {
    let mut rest = bytes;
    while !rest.is_empty() {
        match Packet::decode(rest) {
            Ok((packet, tail)) => {
                rest = tail;
                match packet {
                    Packet::Hybrid(batch) => {
                        for member in batch.packets {
                            queue.push(member);
                        }
                    }
                    other => queue.push(other),
                }
            }
            Err(err) => {
                warn!(%peer, %err, "dropping malformed datagram tail");
                return;
            }
        }
    }
}

/// Outcome of trying to decode one packet from a stream accumulator.
pub enum StreamDecode {
    /// A packet was consumed from the front of the buffer
    Packet(Packet),
    /// The buffer holds a packet prefix; wait for more bytes
    Incomplete,
    /// The buffer cannot become a valid packet
    Corrupt(CodecError),
}

/// Try to decode one packet from the front of a stream reassembly
/// buffer, consuming its bytes on success. Truncation is expected mid
/// stream and reported as [`StreamDecode::Incomplete`].
pub fn decode_from_stream(buf: &mut Vec<u8>) -> StreamDecode {
    if buf.is_empty() {
        return StreamDecode::Incomplete;
    }
    match Packet::decode(buf) {
        Ok((packet, rest)) => {
            let consumed = buf.len() - rest.len();
            buf.drain(..consumed);
            StreamDecode::Packet(packet)
        }
        Err(CodecError::Truncated { .. }) | Err(CodecError::BadPayloadLength { .. }) => {
            StreamDecode::Incomplete
        }
        Err(err) => StreamDecode::Corrupt(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::packet::{HybridPacket, PacketHeader, PacketSequence, Position};
    use crate::time::SimTime;

    fn generic(origin: u32, seq: u32) -> Packet {
        Packet::Generic(PacketHeader::broadcast(
            PacketSequence::new(Address::from_u32(origin), seq),
            SimTime::from_secs(1),
            Position::from_degrees(40.0, -80.0),
        ))
    }

    #[test]
    fn test_rx_queue_keys_by_originator() {
        let queue = RxQueue::new();
        queue.push(generic(1, 1));
        queue.push(generic(1, 2));
        queue.push(generic(2, 1));
        assert_eq!(queue.len(), 3);

        let mut drained = queue.drain_all();
        drained.sort_by_key(|(origin, _)| *origin);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ingest_expands_hybrid_batches() {
        let queue = RxQueue::new();
        let batch = Packet::Hybrid(HybridPacket {
            packets: vec![generic(1, 1), generic(2, 1)],
        });
        ingest_datagram(&batch.encode(), &queue, "test");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_ingest_keeps_packets_before_bad_tail() {
        let queue = RxQueue::new();
        let mut bytes = generic(1, 1).encode();
        bytes.push(0xEE); // unknown kind byte
        ingest_datagram(&bytes, &queue, "test");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stream_decode_waits_for_full_packet() {
        let full = generic(3, 9).encode();
        let mut buf = full[..full.len() - 1].to_vec();
        assert!(matches!(decode_from_stream(&mut buf), StreamDecode::Incomplete));

        buf.push(full[full.len() - 1]);
        match decode_from_stream(&mut buf) {
            StreamDecode::Packet(p) => assert_eq!(p.sequence().unwrap().seq, 9),
            _ => panic!("expected a packet"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stream_decode_flags_corruption() {
        let mut buf = vec![0xEE; 64];
        assert!(matches!(decode_from_stream(&mut buf), StreamDecode::Corrupt(_)));
    }
}
