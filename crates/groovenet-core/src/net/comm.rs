//! Communication-layer policy
//!
//! Sits above the link layer and decides what a delivered message leads
//! to: record it in the per-originator history, queue it for a jittered
//! rebroadcast, or stay quiet. A squelch packet cancels the pending
//! rebroadcast of the message it names. An anti-echo map remembers each
//! message already forwarded and who last forwarded it to us, so an
//! entity neither forwards the same message twice nor echoes it back at
//! a recent sender, even across squelch and history eviction.

use crate::config::{ModelParams, ParamSpec, ParamType};
use crate::net::packet::{Address, Packet, PacketSequence, SafetyPacket};
use crate::error::ConfigError;
use crate::time::SimTime;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Running comm-layer counters, consumed for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommStats {
    /// Messages recorded into the history
    pub messages_heard: u64,
    /// Rebroadcasts actually handed back for transmission
    pub rebroadcasts: u64,
    /// Pending rebroadcasts cancelled by a squelch
    pub squelched: u64,
}

/// One remembered safety message from an originator.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub packet: SafetyPacket,
    /// Immediate forwarder that delivered this copy (the originator
    /// itself on first hop)
    pub forwarder: Address,
    pub rx_time: SimTime,
}

/// Closed set of comm-layer policies, selected by type tag at init.
#[derive(Debug)]
pub enum CommPolicy {
    /// Record history, never forward
    Silent(SilentComm),
    /// Flooding relay with jittered rebroadcast and squelch handling
    Flood(FloodComm),
}

impl CommPolicy {
    /// Type tags accepted by [`CommPolicy::from_tag`]
    pub const TAGS: &'static [&'static str] = &["silent", "flood"];

    /// Build a policy from its configuration tag
    pub fn from_tag(tag: &str, params: &ModelParams) -> Result<Self, ConfigError> {
        match tag {
            "silent" => Ok(CommPolicy::Silent(SilentComm::from_params(params)?)),
            "flood" => Ok(CommPolicy::Flood(FloodComm::from_params(params)?)),
            other => Err(ConfigError::UnknownPolicy {
                model: params.model.clone(),
                tag: other.to_string(),
            }),
        }
    }

    /// Whether this entity relays traffic toward the infrastructure side
    pub fn is_gateway(&self) -> bool {
        match self {
            CommPolicy::Silent(c) => c.history.gateway,
            CommPolicy::Flood(c) => c.history.gateway,
        }
    }

    /// A message cleared the link layer. Records it and, for the flood
    /// policy, may queue a rebroadcast.
    pub fn deliver(&mut self, packet: &Packet, local: Address, now: SimTime) {
        match self {
            CommPolicy::Silent(c) => {
                if let Packet::Safety(p) = packet {
                    c.history.record(p, now);
                }
            }
            CommPolicy::Flood(c) => c.deliver(packet, local, now),
        }
    }

    /// Rebroadcasts whose jitter delay has elapsed
    pub fn take_due_rebroadcasts(&mut self, now: SimTime) -> Vec<Packet> {
        match self {
            CommPolicy::Silent(_) => Vec::new(),
            CommPolicy::Flood(c) => c.take_due(now),
        }
    }

    /// Recent messages heard from one originator, newest last
    pub fn history_of(&self, origin: Address) -> &[HistoryEntry] {
        let history = match self {
            CommPolicy::Silent(c) => &c.history,
            CommPolicy::Flood(c) => &c.history,
        };
        history
            .by_origin
            .get(&origin)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Telemetry counters
    pub fn stats(&self) -> CommStats {
        match self {
            CommPolicy::Silent(c) => c.history.stats,
            CommPolicy::Flood(c) => c.history.stats,
        }
    }

    /// Evict history entries not refreshed since `cutoff`
    pub fn tick(&mut self, cutoff: SimTime) {
        match self {
            CommPolicy::Silent(c) => c.history.evict_older_than(cutoff),
            CommPolicy::Flood(c) => c.history.evict_older_than(cutoff),
        }
    }

    /// Reset between trials
    pub fn reset(&mut self) {
        match self {
            CommPolicy::Silent(c) => c.history.clear(),
            CommPolicy::Flood(c) => {
                c.history.clear();
                c.pending.clear();
                c.forwarded.clear();
                c.forwarded_order.clear();
            }
        }
    }
}

/// Per-originator message history shared by every comm policy.
#[derive(Debug)]
struct MessageHistory {
    by_origin: HashMap<Address, Vec<HistoryEntry>>,
    per_origin_cap: usize,
    gateway: bool,
    stats: CommStats,
}

impl MessageHistory {
    fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "comm.history_per_origin",
            ParamSpec::new("16", "safety messages kept per originator", ParamType::Int),
        );
        declared.declare(
            "comm.gateway",
            ParamSpec::new(
                "false",
                "relay received traffic toward infrastructure entities",
                ParamType::Bool,
            ),
        );
        Ok(Self {
            by_origin: HashMap::new(),
            per_origin_cap: declared.get_u32("comm.history_per_origin")?.max(1) as usize,
            gateway: declared.get_bool("comm.gateway")?,
            stats: CommStats::default(),
        })
    }

    fn record(&mut self, packet: &SafetyPacket, now: SimTime) {
        self.stats.messages_heard += 1;
        let entries = self
            .by_origin
            .entry(packet.header.sequence.origin)
            .or_default();
        if entries.len() == self.per_origin_cap {
            entries.remove(0);
        }
        entries.push(HistoryEntry {
            packet: packet.clone(),
            forwarder: packet.header.tx_addr,
            rx_time: now,
        });
    }

    fn evict_older_than(&mut self, cutoff: SimTime) {
        self.by_origin.retain(|_, entries| {
            entries.retain(|e| e.rx_time >= cutoff);
            !entries.is_empty()
        });
    }

    fn clear(&mut self) {
        self.by_origin.clear();
        self.stats = CommStats::default();
    }
}

/// Listen-only policy: history and telemetry without relaying.
#[derive(Debug)]
pub struct SilentComm {
    history: MessageHistory,
}

impl SilentComm {
    pub fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        Ok(Self {
            history: MessageHistory::from_params(params)?,
        })
    }
}

/// A rebroadcast waiting out its jitter delay.
#[derive(Debug)]
struct PendingRebroadcast {
    due: SimTime,
    packet: Packet,
}

/// Flooding relay: every delivered safety message is queued for one
/// rebroadcast after a random jitter, unless this entity originated it,
/// already forwarded it, or hears a squelch first.
#[derive(Debug)]
pub struct FloodComm {
    history: MessageHistory,
    pending: Vec<PendingRebroadcast>,
    /// Messages already forwarded (or squelched), with the address that
    /// last forwarded each one to us. Bounded LRU by recency.
    forwarded: HashMap<PacketSequence, Address>,
    forwarded_order: VecDeque<PacketSequence>,
    forwarded_cap: usize,
    max_jitter: Duration,
    rng: rand::rngs::StdRng,
}

impl FloodComm {
    pub fn from_params(params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "comm.jitter_ms",
            ParamSpec::new(
                "100",
                "maximum random delay before a rebroadcast, milliseconds",
                ParamType::Int,
            ),
        );
        declared.declare(
            "comm.forwarded_cap",
            ParamSpec::new(
                "1024",
                "size of the already-forwarded suppression set",
                ParamType::Int,
            ),
        );
        let rng = match declared.get("comm.seed") {
            Some(raw) => {
                let seed = raw
                    .parse::<u64>()
                    .map_err(|e| ConfigError::InvalidParam {
                        model: declared.model.clone(),
                        key: "comm.seed".to_string(),
                        reason: e.to_string(),
                    })?;
                rand::rngs::StdRng::seed_from_u64(seed)
            }
            None => rand::rngs::StdRng::from_entropy(),
        };
        Ok(Self {
            history: MessageHistory::from_params(params)?,
            pending: Vec::new(),
            forwarded: HashMap::new(),
            forwarded_order: VecDeque::new(),
            forwarded_cap: declared.get_u32("comm.forwarded_cap")?.max(1) as usize,
            max_jitter: Duration::from_millis(declared.get_u64("comm.jitter_ms")?),
            rng,
        })
    }

    fn deliver(&mut self, packet: &Packet, local: Address, now: SimTime) {
        match packet {
            Packet::Safety(p) => {
                self.history.record(p, now);
                self.queue_rebroadcast(packet, &p.header, local, now);
            }
            Packet::Generic(header) => {
                self.queue_rebroadcast(packet, header, local, now);
            }
            Packet::Squelch(p) => self.squelch(p.squelched, p.header.tx_addr),
            // Tunnel batches are unpacked by the transport layer
            Packet::Hybrid(_) => {}
        }
    }

    fn queue_rebroadcast(
        &mut self,
        packet: &Packet,
        header: &crate::net::packet::PacketHeader,
        local: Address,
        now: SimTime,
    ) {
        let seq = header.sequence;
        // Never echo our own messages, and forward each message once
        if seq.origin == local || self.forwarded.contains_key(&seq) {
            return;
        }
        self.mark_forwarded(seq, header.tx_addr);

        let jitter_us = if self.max_jitter.is_zero() {
            0
        } else {
            self.rng.gen_range(0..=self.max_jitter.as_micros() as u64)
        };
        self.pending.push(PendingRebroadcast {
            due: now + Duration::from_micros(jitter_us),
            packet: packet.clone(),
        });
    }

    fn squelch(&mut self, squelched: PacketSequence, squelcher: Address) {
        let before = self.pending.len();
        self.pending
            .retain(|p| p.packet.sequence() != Some(squelched));
        self.history.stats.squelched += (before - self.pending.len()) as u64;
        // Stays in the forwarded map: squelched means someone else
        // covered it, not that we should forward it later.
        self.mark_forwarded(squelched, squelcher);
    }

    fn mark_forwarded(&mut self, seq: PacketSequence, forwarder: Address) {
        if self.forwarded.insert(seq, forwarder).is_some() {
            // Refresh who last forwarded it; the entry keeps its slot
            return;
        }
        self.forwarded_order.push_back(seq);
        while self.forwarded_order.len() > self.forwarded_cap {
            if let Some(evicted) = self.forwarded_order.pop_front() {
                self.forwarded.remove(&evicted);
            }
        }
    }

    /// Who last forwarded (or squelched) this message to us, if it is
    /// still in the bounded suppression map
    pub fn last_forwarder(&self, seq: PacketSequence) -> Option<Address> {
        self.forwarded.get(&seq).copied()
    }

    fn take_due(&mut self, now: SimTime) -> Vec<Packet> {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].due <= now {
                due.push(self.pending.swap_remove(i).packet);
            } else {
                i += 1;
            }
        }
        self.history.stats.rebroadcasts += due.len() as u64;
        due
    }

    /// Number of rebroadcasts still waiting out their jitter
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::packet::{
        BoundingRegion, PacketHeader, Position, SquelchPacket, VehicleState,
    };

    fn flood() -> FloodComm {
        let params = ModelParams::new("test")
            .with("comm.seed", "7")
            .with("comm.jitter_ms", "100");
        FloodComm::from_params(&params).unwrap()
    }

    fn safety(origin: u32, seq: u32, tx_secs: u64) -> Packet {
        let origin = Address::from_u32(origin);
        Packet::Safety(SafetyPacket {
            header: PacketHeader::broadcast(
                PacketSequence::new(origin, seq),
                SimTime::from_secs(tx_secs),
                Position::from_degrees(40.0, -80.0),
            ),
            subject: origin,
            subject_position: Position::from_degrees(40.0, -80.0),
            subject_state: VehicleState::default(),
            lifetime_secs: 5.0,
            region: BoundingRegion::None,
            payload: Vec::new(),
        })
    }

    #[test]
    fn test_flood_queues_one_rebroadcast() {
        let mut comm = flood();
        let local = Address::from_u32(99);
        let p = safety(1, 7, 10);
        let now = SimTime::from_secs(10);

        comm.deliver(&p, local, now);
        comm.deliver(&p, local, now); // second copy does not queue again
        assert_eq!(comm.pending_len(), 1);

        // Nothing due before the jitter elapses
        assert!(comm.take_due(now).is_empty());
        let due = comm.take_due(now + Duration::from_millis(100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].sequence(), p.sequence());
    }

    #[test]
    fn test_forwarder_recorded() {
        let local = Address::from_u32(99);
        let relay = Address::from_u32(5);
        let origin = Address::from_u32(1);
        let mut p = safety(1, 7, 10);
        if let Packet::Safety(sp) = &mut p {
            sp.header.tx_addr = relay;
        }

        let mut comm = flood();
        comm.deliver(&p, local, SimTime::from_secs(10));
        assert_eq!(comm.last_forwarder(p.sequence().unwrap()), Some(relay));

        let policy = CommPolicy::Flood(comm);
        let history = policy.history_of(origin);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].forwarder, relay);
    }

    #[test]
    fn test_own_messages_never_echoed() {
        let mut comm = flood();
        let local = Address::from_u32(1);
        comm.deliver(&safety(1, 7, 10), local, SimTime::from_secs(10));
        assert_eq!(comm.pending_len(), 0);
    }

    #[test]
    fn test_squelch_cancels_pending() {
        let mut comm = flood();
        let local = Address::from_u32(99);
        let p = safety(1, 7, 10);
        let now = SimTime::from_secs(10);
        comm.deliver(&p, local, now);
        assert_eq!(comm.pending_len(), 1);

        let squelch = Packet::Squelch(SquelchPacket {
            header: PacketHeader::broadcast(
                PacketSequence::new(Address::from_u32(2), 1),
                now,
                Position::from_degrees(40.0, -80.0),
            ),
            squelched: p.sequence().unwrap(),
        });
        comm.deliver(&squelch, local, now);
        assert_eq!(comm.pending_len(), 0);
        // The squelcher is recorded as the last forwarder
        assert_eq!(
            comm.last_forwarder(p.sequence().unwrap()),
            Some(Address::from_u32(2))
        );

        // The squelched message does not come back if heard again
        comm.deliver(&p, local, now);
        assert_eq!(comm.pending_len(), 0);
    }

    #[test]
    fn test_history_records_and_evicts() {
        let params = ModelParams::new("test").with("comm.history_per_origin", "2");
        let mut comm = CommPolicy::Silent(SilentComm::from_params(&params).unwrap());
        let local = Address::from_u32(99);
        let origin = Address::from_u32(1);

        for seq in 0..3 {
            comm.deliver(&safety(1, seq, 10 + seq as u64), local, SimTime::from_secs(10 + seq as u64));
        }
        // Bounded per originator, oldest evicted first
        let history = comm.history_of(origin);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].packet.header.sequence.seq, 1);

        comm.tick(SimTime::from_secs(12));
        assert_eq!(comm.history_of(origin).len(), 1);
    }

    #[test]
    fn test_silent_never_forwards() {
        let mut comm =
            CommPolicy::Silent(SilentComm::from_params(&ModelParams::new("test")).unwrap());
        comm.deliver(&safety(1, 1, 10), Address::from_u32(99), SimTime::from_secs(10));
        assert!(comm.take_due_rebroadcasts(SimTime::from_secs(60)).is_empty());
        assert_eq!(comm.stats().messages_heard, 1);
    }
}
