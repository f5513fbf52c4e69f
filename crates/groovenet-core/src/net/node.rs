//! Simulated entities
//!
//! A [`Vehicle`] is a moving radio: kinematic state, the three protocol
//! layers, a transmit sequence counter, and a bounded cache of vehicles
//! it has heard from. A [`RoadsideUnit`] is the fixed flavor of the
//! same stack. Both implement [`Model`], the lifecycle the simulator
//! drives: pre-run scheduling, event processing, post-run, and a reset
//! between Monte-Carlo trials.
//!
//! Reception is a two-event state machine. `ReceiveBegin` runs the
//! admission checks and opens the reception window; `ReceiveEnd` fires
//! when the window closes and either delivers the packet up through the
//! comm layer or drops it with a [`DropReason`]. There is no retry
//! path: a dropped packet is gone.

use crate::config::{ModelParams, ParamSpec, ParamType};
use crate::error::{ConfigError, DropReason};
use crate::net::comm::CommPolicy;
use crate::net::link::LinkPolicy;
use crate::net::packet::{
    Address, BoundingRegion, Packet, PacketHeader, PacketSequence, Position, SafetyPacket,
    VehicleState,
};
use crate::net::phys::PhysPolicy;
use crate::net::registry::Locatable;
use crate::sim::context::SimContext;
use crate::sim::event::{EventPayload, EventPriority, EventQueue, SimEvent};
use crate::time::SimTime;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Strictly increasing, gap-free counter for transmit and reception
/// sequence numbers. Concurrent callers each get a distinct value.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU32);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number, starting at 1
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last value handed out
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// Per-entity traffic counters.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub transmitted: u64,
    pub delivered: u64,
    pub dropped: HashMap<DropReason, u64>,
}

impl NodeStats {
    fn record_drop(&mut self, reason: DropReason) {
        *self.dropped.entry(reason).or_insert(0) += 1;
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.values().sum()
    }

    /// Fold another entity's counters into this one
    pub fn merge(&mut self, other: &NodeStats) {
        self.transmitted += other.transmitted;
        self.delivered += other.delivered;
        for (reason, count) in &other.dropped {
            *self.dropped.entry(*reason).or_insert(0) += count;
        }
    }
}

/// One remembered neighbor.
#[derive(Debug, Clone)]
pub struct KnownVehicle {
    /// Most recent safety message about this vehicle
    pub packet: SafetyPacket,
    pub last_seen: SimTime,
}

/// Bounded cache of vehicles this entity has heard about, keyed by the
/// message subject. Stale entries are evicted on the Update tick; when
/// full, the oldest entry makes room.
#[derive(Debug)]
pub struct KnownVehicles {
    entries: HashMap<Address, KnownVehicle>,
    cap: usize,
    timeout: Duration,
}

impl KnownVehicles {
    pub fn new(cap: usize, timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            cap: cap.max(1),
            timeout,
        }
    }

    pub fn update(&mut self, packet: &SafetyPacket, now: SimTime) {
        if self.entries.len() == self.cap && !self.entries.contains_key(&packet.subject) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.last_seen)
                .map(|(a, _)| *a)
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            packet.subject,
            KnownVehicle {
                packet: packet.clone(),
                last_seen: now,
            },
        );
    }

    pub fn get(&self, addr: Address) -> Option<&KnownVehicle> {
        self.entries.get(&addr)
    }

    pub fn evict_stale(&mut self, now: SimTime) {
        let timeout = self.timeout;
        self.entries
            .retain(|_, v| now.saturating_sub(v.last_seen) <= timeout);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Lifecycle the simulator drives on every registered model.
pub trait Model: Send {
    /// Model instance name, the event-dispatch key
    fn name(&self) -> &str;

    fn address(&self) -> Address;

    /// Names of models that must pre-run before this one
    fn dependencies(&self) -> &[String];

    /// Schedule initial events for a trial
    fn pre_run(&mut self, ctx: &SimContext, queue: &mut EventQueue, now: SimTime);

    fn process_event(&mut self, event: SimEvent, ctx: &SimContext, queue: &mut EventQueue);

    /// Trial finished; flush any end-of-run state
    fn post_run(&mut self, now: SimTime);

    /// Clear per-trial state before the next trial
    fn reset(&mut self);
}

/// The three protocol layers plus the counters they share. Both entity
/// kinds embed one of these; the state machine below is the only place
/// packets move between layers.
#[derive(Debug)]
pub struct ProtocolStack {
    pub addr: Address,
    pub link: LinkPolicy,
    pub phys: PhysPolicy,
    pub comm: CommPolicy,
    tx_seq: SequenceCounter,
    rx_seq: SequenceCounter,
    pub stats: NodeStats,
}

impl ProtocolStack {
    pub fn from_params(addr: Address, params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "link.policy",
            ParamSpec::new("simple", "link layer policy tag", ParamType::Text),
        );
        declared.declare(
            "phys.policy",
            ParamSpec::new("range", "physical layer policy tag", ParamType::Text),
        );
        declared.declare(
            "comm.policy",
            ParamSpec::new("flood", "communication layer policy tag", ParamType::Text),
        );
        Ok(Self {
            addr,
            link: LinkPolicy::from_tag(&declared.get_text("link.policy")?, params)?,
            phys: PhysPolicy::from_tag(&declared.get_text("phys.policy")?, params)?,
            comm: CommPolicy::from_tag(&declared.get_text("comm.policy")?, params)?,
            tx_seq: SequenceCounter::new(),
            rx_seq: SequenceCounter::new(),
            stats: NodeStats::default(),
        })
    }

    /// Fresh message identity for an originated packet
    pub fn next_sequence(&self) -> PacketSequence {
        PacketSequence::new(self.addr, self.tx_seq.next())
    }

    /// Admission and window-open half of reception. On success returns
    /// the window close time; the caller schedules `ReceiveEnd` there.
    fn receive_begin(
        &mut self,
        packet: &mut Packet,
        local_pos: Position,
        active: bool,
        now: SimTime,
    ) -> Result<SimTime, DropReason> {
        let tx_pos = match packet.header() {
            Some(h) => h.tx_position,
            None => return Err(DropReason::AddressMismatch), // bare batches never reach entities
        };
        self.phys.receive_packet(&local_pos, &tx_pos, active)?;
        self.link.receive_packet(packet, self.addr, now)?;

        let end = now + self.phys.airtime(packet.encode().len());
        self.phys.begin_process_packet(now, end)?;
        self.link.begin_process_packet(packet, now);
        Ok(end)
    }

    /// Window-close half of reception: duplicate/lifetime resolution,
    /// receive-side header patching, and delivery to the comm layer.
    fn receive_end(&mut self, mut packet: Packet, now: SimTime) -> Result<Packet, DropReason> {
        self.phys.end_process_packet(now);
        self.link.end_process_packet(&packet, now)?;

        let lifetime = self.link.lifetime_of(&packet);
        let sequence = match packet.sequence() {
            Some(seq) => seq,
            None => return Err(DropReason::AddressMismatch),
        };
        if !self.link.add_received_packet(sequence, now, lifetime) {
            return Err(DropReason::Duplicate);
        }

        if let Some(header) = packet.header_mut() {
            header.rx_time = now;
            header.rx_addr = self.addr;
            header.rx_count = self.rx_seq.next();
        }
        self.comm.deliver(&packet, self.addr, now);
        self.stats.delivered += 1;
        Ok(packet)
    }

    fn tick(&mut self, now: SimTime, history_cutoff: SimTime) {
        self.link.tick(now);
        self.comm.tick(history_cutoff);
    }

    fn reset(&mut self) {
        self.link.reset();
        self.phys.reset();
        self.comm.reset();
        self.tx_seq.reset();
        self.rx_seq.reset();
        self.stats = NodeStats::default();
    }
}

/// Patch the forwarder fields of an outgoing packet and fan it out: a
/// `ReceiveBegin` event per in-range local entity (delayed by signal
/// propagation), plus the network transport when one is attached and
/// the sender participates in it.
fn transmit(
    stack: &mut ProtocolStack,
    mut packet: Packet,
    pos: Position,
    heading_deg: f32,
    source: &str,
    ctx: &SimContext,
    queue: &mut EventQueue,
    now: SimTime,
) {
    if let Some(header) = packet.header_mut() {
        header.tx_addr = stack.addr;
        header.tx_time = now;
        header.tx_position = pos;
        header.tx_heading = heading_deg;
    }
    stack.stats.transmitted += 1;

    if let Some(seq) = packet.sequence() {
        ctx.track_message(seq, now + stack.link.lifetime_of(&packet));
        trace!(addr = %stack.addr, %seq, "transmit");
    }

    // Originated traffic always fans out everywhere; relayed traffic
    // reaches infrastructure and the wire only through gateways.
    let originated = packet
        .sequence()
        .map(|s| s.origin == stack.addr)
        .unwrap_or(false);

    let range = stack.phys.range_m();
    for (_, handle) in ctx.vehicles.within_range(pos, range, stack.addr) {
        let peer = handle.lock().unwrap();
        // Promoted remotes mirror another process; the real vehicle
        // hears this packet through its own transport.
        if !peer.is_local() {
            continue;
        }
        let delay = stack.phys.propagation_delay(pos.distance_m(&peer.position()));
        queue.schedule(
            SimEvent::new(
                now + delay,
                EventPriority::High,
                peer.name(),
                EventPayload::ReceiveBegin(Box::new(packet.clone())),
            )
            .with_source(source),
        );
    }
    if originated || stack.comm.is_gateway() {
        for (_, handle) in ctx.infrastructure.within_range(pos, range, stack.addr) {
            let peer = handle.lock().unwrap();
            let delay = stack.phys.propagation_delay(pos.distance_m(&peer.position()));
            queue.schedule(
                SimEvent::new(
                    now + delay,
                    EventPriority::High,
                    peer.name(),
                    EventPayload::ReceiveBegin(Box::new(packet.clone())),
                )
                .with_source(source),
            );
        }
    }

    if let Some(network) = &ctx.network {
        if originated || stack.comm.is_gateway() {
            if let Err(e) = network.broadcast(&packet) {
                warn!(addr = %stack.addr, error = %e, "network send failed, packet dropped");
            }
        }
    }
}

/// Shared event dispatch for both entity kinds.
fn handle_receive_event(
    stack: &mut ProtocolStack,
    payload: EventPayload,
    pos: Position,
    active: bool,
    name: &str,
    queue: &mut EventQueue,
    now: SimTime,
) -> Option<Packet> {
    match payload {
        EventPayload::ReceiveBegin(mut packet) => {
            match stack.receive_begin(&mut *packet, pos, active, now) {
                Ok(end) => {
                    queue.schedule(
                        SimEvent::new(
                            end,
                            EventPriority::High,
                            name,
                            EventPayload::ReceiveEnd(packet),
                        )
                        .with_source(name),
                    );
                }
                Err(reason) => {
                    debug!(%name, %reason, "packet dropped at receive begin");
                    stack.stats.record_drop(reason);
                }
            }
            None
        }
        EventPayload::ReceiveEnd(packet) => match stack.receive_end(*packet, now) {
            Ok(delivered) => Some(delivered),
            Err(reason) => {
                debug!(%name, %reason, "packet dropped at receive end");
                stack.stats.record_drop(reason);
                None
            }
        },
        EventPayload::Update => None,
    }
}

/// A simulated vehicle.
pub struct Vehicle {
    name: String,
    stack: ProtocolStack,
    dependencies: Vec<String>,
    position: Position,
    speed_mps: f32,
    heading_deg: f32,
    active: bool,
    /// False for vehicles promoted from network traffic
    is_local: bool,
    known: KnownVehicles,
    update_interval: Duration,
    beacon_interval: Option<Duration>,
    beacon_lifetime_secs: f32,
    last_update: SimTime,
    last_beacon: SimTime,
    road_record: u32,
}

impl Vehicle {
    pub fn from_params(name: &str, params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "node.lat",
            ParamSpec::new("0.0", "initial latitude, degrees", ParamType::Float),
        );
        declared.declare(
            "node.lon",
            ParamSpec::new("0.0", "initial longitude, degrees", ParamType::Float),
        );
        declared.declare(
            "node.speed_mps",
            ParamSpec::new("0.0", "initial speed, meters/second", ParamType::Float),
        );
        declared.declare(
            "node.heading_deg",
            ParamSpec::new("0.0", "initial heading, degrees from north", ParamType::Float),
        );
        declared.declare(
            "node.update_interval_ms",
            ParamSpec::new("500", "kinematics update period", ParamType::Int),
        );
        declared.declare(
            "node.beacon_interval_ms",
            ParamSpec::new("0", "safety beacon period, 0 disables", ParamType::Int),
        );
        declared.declare(
            "node.beacon_lifetime_secs",
            ParamSpec::new("5.0", "lifetime stamped on beacons", ParamType::Float),
        );
        declared.declare(
            "node.known_cap",
            ParamSpec::new("256", "known-vehicle cache capacity", ParamType::Int),
        );
        declared.declare(
            "node.known_timeout_secs",
            ParamSpec::new("10.0", "known-vehicle staleness timeout", ParamType::Float),
        );

        let addr = declared.get_address("node.addr")?;
        let beacon_ms = declared.get_u64("node.beacon_interval_ms")?;
        Ok(Self {
            name: name.to_string(),
            stack: ProtocolStack::from_params(addr, params)?,
            dependencies: Vec::new(),
            position: Position::from_degrees(
                declared.get_f64("node.lat")?,
                declared.get_f64("node.lon")?,
            ),
            speed_mps: declared.get_f64("node.speed_mps")? as f32,
            heading_deg: declared.get_f64("node.heading_deg")? as f32,
            active: true,
            is_local: true,
            known: KnownVehicles::new(
                declared.get_u32("node.known_cap")? as usize,
                Duration::from_secs_f64(declared.get_f64("node.known_timeout_secs")?),
            ),
            update_interval: Duration::from_millis(
                declared.get_u64("node.update_interval_ms")?.max(1),
            ),
            beacon_interval: (beacon_ms > 0).then(|| Duration::from_millis(beacon_ms)),
            beacon_lifetime_secs: declared.get_f64("node.beacon_lifetime_secs")? as f32,
            last_update: SimTime::ZERO,
            last_beacon: SimTime::ZERO,
            road_record: 0,
        })
    }

    /// Stand-in for a vehicle in another process, created when the
    /// transport hears an unknown originator.
    pub fn remote(name: &str, addr: Address, params: &ModelParams) -> Result<Self, ConfigError> {
        let mut v = Self::from_params(
            name,
            &params.clone().with("node.addr", addr.to_string()),
        )?;
        v.is_local = false;
        Ok(v)
    }

    pub fn address(&self) -> Address {
        self.stack.addr
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn set_dependencies(&mut self, deps: Vec<String>) {
        self.dependencies = deps;
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn known_vehicles(&self) -> &KnownVehicles {
        &self.known
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stack.stats
    }

    pub fn stack(&self) -> &ProtocolStack {
        &self.stack
    }

    /// Current kinematic state for outgoing safety messages
    fn vehicle_state(&self) -> VehicleState {
        VehicleState {
            speed_mps: self.speed_mps,
            heading_deg: self.heading_deg,
            record_id: self.road_record,
            lane: 0,
            progress: 0.0,
        }
    }

    /// Originate a safety message and fan it out.
    pub fn send_safety_message(
        &mut self,
        lifetime_secs: f32,
        region: BoundingRegion,
        payload: Vec<u8>,
        ctx: &SimContext,
        queue: &mut EventQueue,
        now: SimTime,
    ) -> PacketSequence {
        let sequence = self.stack.next_sequence();
        let packet = Packet::Safety(SafetyPacket {
            header: PacketHeader::broadcast(sequence, now, self.position),
            subject: self.stack.addr,
            subject_position: self.position,
            subject_state: self.vehicle_state(),
            lifetime_secs,
            region,
            payload,
        });
        transmit(
            &mut self.stack,
            packet,
            self.position,
            self.heading_deg,
            &self.name,
            ctx,
            queue,
            now,
        );
        sequence
    }

    /// Refresh a promoted-remote vehicle from a safety message heard on
    /// the network.
    pub fn apply_remote_state(&mut self, packet: &SafetyPacket, now: SimTime) {
        self.position = packet.subject_position;
        self.speed_mps = packet.subject_state.speed_mps;
        self.heading_deg = packet.subject_state.heading_deg;
        self.road_record = packet.subject_state.record_id;
        self.known.update(packet, now);
    }

    fn advance_kinematics(&mut self, ctx: &SimContext, now: SimTime) {
        let dt = now.saturating_sub(self.last_update).as_secs_f64();
        self.last_update = now;
        if self.speed_mps <= 0.0 || dt <= 0.0 {
            return;
        }
        self.position = self
            .position
            .offset(self.heading_deg as f64, self.speed_mps as f64 * dt);
        if let Some(fix) = ctx.map.position_to_road(self.position) {
            self.road_record = fix.record_id;
        }
    }

    fn update(&mut self, ctx: &SimContext, queue: &mut EventQueue, now: SimTime) {
        self.advance_kinematics(ctx, now);

        let history_cutoff = now.saturating_sub_duration(self.known.timeout);
        self.stack.tick(now, history_cutoff);
        self.known.evict_stale(now);

        if let Some(interval) = self.beacon_interval {
            if now.saturating_sub(self.last_beacon) >= interval {
                self.last_beacon = now;
                self.send_safety_message(
                    self.beacon_lifetime_secs,
                    BoundingRegion::None,
                    Vec::new(),
                    ctx,
                    queue,
                    now,
                );
            }
        }

        for packet in self.stack.comm.take_due_rebroadcasts(now) {
            transmit(
                &mut self.stack,
                packet,
                self.position,
                self.heading_deg,
                &self.name,
                ctx,
                queue,
                now,
            );
        }

        queue.schedule(
            SimEvent::new(
                now + self.update_interval,
                EventPriority::Normal,
                &self.name,
                EventPayload::Update,
            )
            .with_source(&self.name),
        );
    }
}

impl Locatable for Vehicle {
    fn position(&self) -> Position {
        self.position
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Model for Vehicle {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> Address {
        self.stack.addr
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn pre_run(&mut self, _ctx: &SimContext, queue: &mut EventQueue, now: SimTime) {
        self.last_update = now;
        self.last_beacon = now;
        if self.is_local {
            queue.schedule(
                SimEvent::new(now, EventPriority::Normal, &self.name, EventPayload::Update)
                    .with_source(&self.name),
            );
        }
    }

    fn process_event(&mut self, event: SimEvent, ctx: &SimContext, queue: &mut EventQueue) {
        let now = event.time;
        match event.payload {
            EventPayload::Update => self.update(ctx, queue, now),
            payload => {
                let name = self.name.clone();
                if let Some(Packet::Safety(delivered)) = handle_receive_event(
                    &mut self.stack,
                    payload,
                    self.position,
                    self.active,
                    &name,
                    queue,
                    now,
                ) {
                    self.known.update(&delivered, now);
                }
            }
        }
    }

    fn post_run(&mut self, _now: SimTime) {}

    fn reset(&mut self) {
        self.stack.reset();
        self.known.clear();
        self.last_update = SimTime::ZERO;
        self.last_beacon = SimTime::ZERO;
    }
}

/// A fixed roadside unit, usually a gateway between the radio
/// neighborhood and the wired transport.
pub struct RoadsideUnit {
    name: String,
    stack: ProtocolStack,
    dependencies: Vec<String>,
    position: Position,
    active: bool,
    known: KnownVehicles,
    update_interval: Duration,
}

impl RoadsideUnit {
    pub fn from_params(name: &str, params: &ModelParams) -> Result<Self, ConfigError> {
        let mut declared = params.clone();
        declared.declare(
            "node.lat",
            ParamSpec::new("0.0", "installation latitude, degrees", ParamType::Float),
        );
        declared.declare(
            "node.lon",
            ParamSpec::new("0.0", "installation longitude, degrees", ParamType::Float),
        );
        declared.declare(
            "node.update_interval_ms",
            ParamSpec::new("1000", "cache maintenance period", ParamType::Int),
        );
        declared.declare(
            "node.known_cap",
            ParamSpec::new("1024", "known-vehicle cache capacity", ParamType::Int),
        );
        declared.declare(
            "node.known_timeout_secs",
            ParamSpec::new("30.0", "known-vehicle staleness timeout", ParamType::Float),
        );
        let addr = declared.get_address("node.addr")?;
        Ok(Self {
            name: name.to_string(),
            stack: ProtocolStack::from_params(addr, params)?,
            dependencies: Vec::new(),
            position: Position::from_degrees(
                declared.get_f64("node.lat")?,
                declared.get_f64("node.lon")?,
            ),
            active: true,
            known: KnownVehicles::new(
                declared.get_u32("node.known_cap")? as usize,
                Duration::from_secs_f64(declared.get_f64("node.known_timeout_secs")?),
            ),
            update_interval: Duration::from_millis(
                declared.get_u64("node.update_interval_ms")?.max(1),
            ),
        })
    }

    pub fn address(&self) -> Address {
        self.stack.addr
    }

    pub fn set_dependencies(&mut self, deps: Vec<String>) {
        self.dependencies = deps;
    }

    pub fn known_vehicles(&self) -> &KnownVehicles {
        &self.known
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stack.stats
    }

    pub fn stack(&self) -> &ProtocolStack {
        &self.stack
    }
}

impl Locatable for RoadsideUnit {
    fn position(&self) -> Position {
        self.position
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Model for RoadsideUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> Address {
        self.stack.addr
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn pre_run(&mut self, _ctx: &SimContext, queue: &mut EventQueue, now: SimTime) {
        queue.schedule(
            SimEvent::new(now, EventPriority::Normal, &self.name, EventPayload::Update)
                .with_source(&self.name),
        );
    }

    fn process_event(&mut self, event: SimEvent, ctx: &SimContext, queue: &mut EventQueue) {
        let now = event.time;
        match event.payload {
            EventPayload::Update => {
                self.stack.tick(now, now.saturating_sub_duration(self.known.timeout));
                self.known.evict_stale(now);
                for packet in self.stack.comm.take_due_rebroadcasts(now) {
                    transmit(
                        &mut self.stack,
                        packet,
                        self.position,
                        0.0,
                        &self.name,
                        ctx,
                        queue,
                        now,
                    );
                }
                queue.schedule(
                    SimEvent::new(
                        now + self.update_interval,
                        EventPriority::Normal,
                        &self.name,
                        EventPayload::Update,
                    )
                    .with_source(&self.name),
                );
            }
            payload => {
                let name = self.name.clone();
                if let Some(Packet::Safety(delivered)) = handle_receive_event(
                    &mut self.stack,
                    payload,
                    self.position,
                    self.active,
                    &name,
                    queue,
                    now,
                ) {
                    self.known.update(&delivered, now);
                }
            }
        }
    }

    fn post_run(&mut self, _now: SimTime) {}

    fn reset(&mut self) {
        self.stack.reset();
        self.known.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::GridMap;
    use std::sync::Arc;

    fn vehicle_params(addr: &str, lat: f64, lon: f64) -> ModelParams {
        ModelParams::new("test")
            .with("node.addr", addr)
            .with("node.lat", lat.to_string())
            .with("node.lon", lon.to_string())
            .with("comm.seed", "7")
    }

    fn ctx() -> SimContext {
        SimContext::new(Arc::new(GridMap::default()), None)
    }

    #[test]
    fn test_sequence_counter_strictly_increasing() {
        let counter = SequenceCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn test_sequence_counter_concurrent_no_gaps_no_duplicates() {
        let counter = Arc::new(SequenceCounter::new());
        let threads = 4;
        let per_thread = 250u32;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    (0..per_thread).map(|_| counter.next()).collect::<Vec<u32>>()
                })
            })
            .collect();

        let mut seen: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (1..=threads as u32 * per_thread).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_known_vehicles_cap_and_timeout() {
        let mut known = KnownVehicles::new(2, Duration::from_secs(10));
        let mk = |addr: u32, now: u64| {
            let a = Address::from_u32(addr);
            let p = SafetyPacket {
                header: PacketHeader::broadcast(
                    PacketSequence::new(a, 1),
                    SimTime::from_secs(now),
                    Position::default(),
                ),
                subject: a,
                subject_position: Position::default(),
                subject_state: VehicleState::default(),
                lifetime_secs: 5.0,
                region: BoundingRegion::None,
                payload: Vec::new(),
            };
            p
        };
        known.update(&mk(1, 0), SimTime::from_secs(0));
        known.update(&mk(2, 1), SimTime::from_secs(1));
        known.update(&mk(3, 2), SimTime::from_secs(2));
        // Oldest evicted at capacity
        assert_eq!(known.len(), 2);
        assert!(known.get(Address::from_u32(1)).is_none());

        known.evict_stale(SimTime::from_secs(12));
        assert_eq!(known.len(), 1);
        assert!(known.get(Address::from_u32(3)).is_some());
    }

    #[test]
    fn test_safety_message_reaches_neighbor() {
        let ctx = ctx();
        let mut queue = EventQueue::new();
        let now = SimTime::from_secs(10);

        let mut sender =
            Vehicle::from_params("car_a", &vehicle_params("10.0.0.1", 40.0, -80.0)).unwrap();
        let near = Position::from_degrees(40.0, -80.0).offset(90.0, 50.0);
        let receiver = Vehicle::from_params(
            "car_b",
            &vehicle_params("10.0.0.2", near.lat_deg(), near.lon_deg()),
        )
        .unwrap();
        let receiver = ctx.vehicles.insert(receiver.address(), receiver).unwrap();

        let seq =
            sender.send_safety_message(5.0, BoundingRegion::None, Vec::new(), &ctx, &mut queue, now);
        assert!(ctx.is_tracked(seq));

        // ReceiveBegin, then the ReceiveEnd it schedules
        let begin = queue.pop().expect("receive begin scheduled");
        assert_eq!(begin.dest, "car_b");
        receiver.lock().unwrap().process_event(begin, &ctx, &mut queue);

        let end = queue.pop().expect("receive end scheduled");
        receiver.lock().unwrap().process_event(end, &ctx, &mut queue);

        let receiver = receiver.lock().unwrap();
        assert_eq!(receiver.stats().delivered, 1);
        assert!(receiver
            .known_vehicles()
            .get(Address::from_bytes([10, 0, 0, 1]))
            .is_some());
    }

    #[test]
    fn test_relayed_traffic_reaches_infrastructure_only_via_gateway() {
        let ctx = ctx();
        let pos = Position::from_degrees(40.0, -80.0);
        let rsu = RoadsideUnit::from_params(
            "rsu",
            &ModelParams::new("rsu")
                .with("node.addr", "10.0.0.50")
                .with("node.lat", "40.0")
                .with("node.lon", "-80.0"),
        )
        .unwrap();
        ctx.infrastructure.insert(rsu.address(), rsu).unwrap();

        // A packet originated by someone else, i.e. relayed traffic
        let relayed = Packet::Generic(PacketHeader::broadcast(
            PacketSequence::new(Address::from_u32(77), 1),
            SimTime::from_secs(1),
            pos,
        ));

        let mut queue = EventQueue::new();
        let mut plain = ProtocolStack::from_params(
            Address::from_u32(1),
            &ModelParams::new("car").with("comm.seed", "7"),
        )
        .unwrap();
        transmit(&mut plain, relayed.clone(), pos, 0.0, "car", &ctx, &mut queue, SimTime::from_secs(1));
        assert!(queue.is_empty());

        let mut gateway = ProtocolStack::from_params(
            Address::from_u32(2),
            &ModelParams::new("gw")
                .with("comm.seed", "7")
                .with("comm.gateway", "true"),
        )
        .unwrap();
        transmit(&mut gateway, relayed, pos, 0.0, "gw", &ctx, &mut queue, SimTime::from_secs(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().dest, "rsu");
    }

    #[test]
    fn test_out_of_range_neighbor_not_scheduled() {
        let ctx = ctx();
        let mut queue = EventQueue::new();
        let far = Position::from_degrees(40.0, -80.0).offset(90.0, 5_000.0);
        let mut sender =
            Vehicle::from_params("car_a", &vehicle_params("10.0.0.1", 40.0, -80.0)).unwrap();
        let receiver = Vehicle::from_params(
            "car_b",
            &vehicle_params("10.0.0.2", far.lat_deg(), far.lon_deg()),
        )
        .unwrap();
        ctx.vehicles.insert(receiver.address(), receiver).unwrap();

        sender.send_safety_message(
            5.0,
            BoundingRegion::None,
            Vec::new(),
            &ctx,
            &mut queue,
            SimTime::from_secs(1),
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_copy_delivered_once() {
        let ctx = ctx();
        let mut queue = EventQueue::new();
        let now = SimTime::from_secs(10);
        let mut sender =
            Vehicle::from_params("car_a", &vehicle_params("10.0.0.1", 40.0, -80.0)).unwrap();
        let near = Position::from_degrees(40.0, -80.0).offset(90.0, 50.0);
        let receiver = Vehicle::from_params(
            "car_b",
            &vehicle_params("10.0.0.2", near.lat_deg(), near.lon_deg()),
        )
        .unwrap();
        let receiver = ctx.vehicles.insert(receiver.address(), receiver).unwrap();

        sender.send_safety_message(5.0, BoundingRegion::None, Vec::new(), &ctx, &mut queue, now);
        let begin = queue.pop().unwrap();
        let copy = begin.clone();

        receiver.lock().unwrap().process_event(begin, &ctx, &mut queue);
        let end = queue.pop().unwrap();
        receiver.lock().unwrap().process_event(end, &ctx, &mut queue);
        assert_eq!(receiver.lock().unwrap().stats().delivered, 1);

        // Second copy of the same message resolves as a duplicate
        receiver.lock().unwrap().process_event(copy, &ctx, &mut queue);
        if let Some(end2) = queue.pop() {
            receiver.lock().unwrap().process_event(end2, &ctx, &mut queue);
        }
        let receiver = receiver.lock().unwrap();
        assert_eq!(receiver.stats().delivered, 1);
        assert_eq!(
            receiver.stats().dropped.get(&DropReason::Duplicate).copied(),
            Some(1)
        );
    }
}
